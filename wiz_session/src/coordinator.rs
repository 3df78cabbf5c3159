use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;
use wiz_clock::Clock;

use crate::{AuthError, AuthService, CredentialStore, EndReason, Session, SessionInvalidator};

type Outcome = Result<Arc<Session>, AuthError>;
type Flight = watch::Receiver<Option<Outcome>>;

enum RefreshState {
    Idle,
    Refreshing(Flight),
}

/// Renews the access token, merging concurrent requests for renewal into a
/// single call to the authentication service
///
/// While a renewal is in flight, every caller of [`refresh`][Self::refresh]
/// awaits that same renewal and receives its outcome, success or failure.
/// The renewal runs on its own task, so a caller that stops waiting does
/// not cancel it for the others. This requires a Tokio runtime.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    service: Arc<dyn AuthService>,
    store: Arc<dyn CredentialStore>,
    invalidator: SessionInvalidator,
    clock: Arc<dyn Clock + Send + Sync>,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    /// Constructs a new coordinator
    pub fn new(
        service: Arc<dyn AuthService>,
        store: Arc<dyn CredentialStore>,
        invalidator: SessionInvalidator,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                store,
                invalidator,
                clock,
                state: Mutex::new(RefreshState::Idle),
            }),
        }
    }

    /// Renews the access token, or joins a renewal already in flight
    ///
    /// On success the credential store holds the returned session. A terminal
    /// failure has already ended the session through the invalidator by the
    /// time it is returned, unless a later login replaced that session while
    /// the renewal was in flight. Any other failure leaves the store untouched.
    pub async fn refresh(&self) -> Result<Arc<Session>, AuthError> {
        let mut flight = self.join_or_launch();

        let outcome = match flight.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        outcome.unwrap_or(Err(AuthError::Abandoned))
    }

    /// Whether a renewal is currently in flight
    pub fn is_refreshing(&self) -> bool {
        matches!(&*self.state(), RefreshState::Refreshing(flight) if flight.has_changed().is_ok())
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join_or_launch(&self) -> Flight {
        let mut state = self.state();

        if let RefreshState::Refreshing(flight) = &*state {
            if flight.has_changed().is_ok() {
                tracing::debug!("joining renewal already in flight");
                return flight.clone();
            }

            tracing::warn!("previous renewal ended without an outcome, launching another");
        }

        let (tx, rx) = watch::channel(None);
        *state = RefreshState::Refreshing(rx.clone());
        drop(state);

        tokio::spawn(self.clone().fly(tx));
        rx
    }

    async fn fly(self, tx: watch::Sender<Option<Outcome>>) {
        let session = self.inner.store.read();
        let outcome = match &session {
            Some(session) => self.renew(session).await,
            None => Err(AuthError::NoSession),
        };

        match (&outcome, &session) {
            (Err(error), Some(session)) if error.is_terminal() => {
                tracing::warn!(
                    error = (error as &dyn std::error::Error),
                    "session renewal refused, ending session"
                );
                let reason = EndReason::for_error(error).unwrap_or(EndReason::Unauthorized);
                self.inner
                    .invalidator
                    .invalidate_if_current(session.credentials().refresh_token(), reason)
                    .await;
            }
            (Err(error), _) => {
                tracing::warn!(
                    error = (error as &dyn std::error::Error),
                    "session renewal failed, keeping current credentials"
                );
            }
            (Ok(_), _) => {}
        }

        let mut state = self.state();
        *state = RefreshState::Idle;
        tx.send_replace(Some(outcome));
    }

    async fn renew(&self, session: &Session) -> Outcome {
        let current = session.credentials();

        tracing::debug!(
            expires_at = current.expires_at().0,
            "requesting renewed access token"
        );

        let grant = self.inner.service.refresh(current.refresh_token()).await?;
        let credentials =
            current.renewed(grant.access_token, self.inner.clock.now(), grant.expires_in)?;

        let renewed = self
            .inner
            .store
            .renew(current.refresh_token(), credentials)
            .ok_or_else(|| {
                tracing::debug!("session ended while renewal was in flight, discarding token");
                AuthError::NoSession
            })?;

        tracing::info!(
            lifetime = renewed.credentials().lifetime().0,
            expires_at = renewed.credentials().expires_at().0,
            "renewed access token"
        );

        self.inner.invalidator.persist(&renewed).await;
        Ok(renewed)
    }
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("service", &self.inner.service)
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}
