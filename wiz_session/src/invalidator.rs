use std::{fmt, sync::Arc};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::{
    AuthError, CredentialStore, ErrorCode, ReadCache, RefreshTokenRef, Session,
    SessionPersistence,
};

/// Why a session ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The refresh token had expired
    TokenExpired,
    /// The refresh token was malformed or revoked
    TokenInvalid,
    /// The authentication service refused renewal without a recognized code
    Unauthorized,
    /// A request was still refused after its credentials were renewed
    RetryRejected,
    /// A newly exchanged session could not be verified
    VerificationFailed,
    /// The user logged out
    LoggedOut,
}

impl EndReason {
    /// The reason a terminal renewal failure ends a session, if it does
    pub fn for_error(error: &AuthError) -> Option<Self> {
        error.code().map(Self::from)
    }

    /// The wire representation of the reason
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::Unauthorized => "unauthorized",
            Self::RetryRejected => "retry_rejected",
            Self::VerificationFailed => "verification_failed",
            Self::LoggedOut => "logged_out",
        }
    }
}

impl From<ErrorCode> for EndReason {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::TokenExpired => Self::TokenExpired,
            ErrorCode::TokenInvalid => Self::TokenInvalid,
            ErrorCode::Other => Self::Unauthorized,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signal sent to whoever routes the user back to a login surface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEnded {
    /// Why the session ended
    pub reason: EndReason,
    /// Whether this signal tore a session down, or repeated an earlier teardown
    pub torn_down: bool,
}

/// Tears sessions down and announces that they ended
///
/// Teardown clears the credential store first, so any request started after
/// [`invalidate`][Self::invalidate] returns observes no credentials.
///
/// Writes to the persisted copy also go through the invalidator, so that a
/// session ended while it was being persisted is not written back afterwards.
#[derive(Clone)]
pub struct SessionInvalidator {
    store: Arc<dyn CredentialStore>,
    cache: Arc<ReadCache>,
    persistence: Arc<dyn SessionPersistence>,
    persisting: Arc<Mutex<()>>,
    signal: broadcast::Sender<SessionEnded>,
}

impl SessionInvalidator {
    const SIGNAL_CAPACITY: usize = 16;

    /// Constructs an invalidator over the given session state
    pub fn new(
        store: Arc<dyn CredentialStore>,
        cache: Arc<ReadCache>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Self {
        let (signal, _) = broadcast::channel(Self::SIGNAL_CAPACITY);
        Self {
            store,
            cache,
            persistence,
            persisting: Arc::default(),
            signal,
        }
    }

    /// Subscribes to session-ended signals
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEnded> {
        self.signal.subscribe()
    }

    /// Ends the current session
    ///
    /// Clears the credential store, the read cache, and any persisted copy,
    /// then emits a [`SessionEnded`] signal. When no session is stored the
    /// teardown is skipped but the signal is still emitted. Returns whether a
    /// session was torn down.
    pub async fn invalidate(&self, reason: EndReason) -> bool {
        let removed = self.store.clear();
        self.end(removed, reason).await
    }

    /// Ends the session issued with `refresh_token`
    ///
    /// Behaves like [`invalidate`][Self::invalidate], except that a session
    /// from a later login is left in place and no signal is emitted for it.
    pub async fn invalidate_if_current(
        &self,
        refresh_token: &RefreshTokenRef,
        reason: EndReason,
    ) -> bool {
        let removed = self.store.clear_if(refresh_token);
        if removed.is_none() && self.store.read().is_some() {
            tracing::debug!(%reason, "session was replaced by a later login, leaving it in place");
            return false;
        }

        self.end(removed, reason).await
    }

    /// Persists `session` if it is still the current session
    ///
    /// A session that has since been ended or replaced is not written.
    /// Failures are logged.
    pub async fn persist(&self, session: &Arc<Session>) {
        let _persisting = self.persisting.lock().await;

        match self.store.read() {
            Some(current) if Arc::ptr_eq(&current, session) => {}
            _ => {
                tracing::debug!("session changed before it could be persisted, skipping");
                return;
            }
        }

        if let Err(error) = self.persistence.persist(session).await {
            tracing::warn!(
                error = (&*error as &dyn std::error::Error),
                "unable to persist session"
            );
        }
    }

    async fn end(&self, removed: Option<Arc<Session>>, reason: EndReason) -> bool {
        let torn_down = match removed {
            Some(session) => {
                let dropped = self.cache.clear();
                tracing::info!(
                    %reason,
                    user.id = session.user().id,
                    cache.dropped = dropped,
                    "session ended"
                );

                let _persisting = self.persisting.lock().await;
                if let Err(error) = self.persistence.erase().await {
                    tracing::warn!(
                        error = (&*error as &dyn std::error::Error),
                        "unable to erase persisted session"
                    );
                }
                true
            }
            None => {
                tracing::debug!(%reason, "no session to end, repeating signal");
                false
            }
        };

        if self
            .signal
            .send(SessionEnded { reason, torn_down })
            .is_err()
        {
            tracing::trace!("no one is listening for session-ended signals");
        }

        torn_down
    }
}

impl fmt::Debug for SessionInvalidator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionInvalidator")
            .field("store", &self.store)
            .field("persistence", &self.persistence)
            .field("listeners", &self.signal.receiver_count())
            .finish()
    }
}
