//! Storage for the current session

use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;

use crate::{CredentialSet, RefreshTokenRef, Session, UserSnapshot};

/// Holds the current session
///
/// Every operation is atomic with respect to concurrent readers: a reader sees
/// either the complete previous session or the complete new one, never a mix.
/// Implementations perform no I/O against the authentication service.
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Reads the current session, if any
    fn read(&self) -> Option<Arc<Session>>;

    /// Replaces the current session
    fn write(&self, session: Session) -> Arc<Session>;

    /// Replaces the credentials of the current session, but only if it still
    /// holds `refresh_token`
    ///
    /// Returns the updated session, or `None` if the session was cleared or
    /// replaced in the meantime.
    fn renew(
        &self,
        refresh_token: &RefreshTokenRef,
        credentials: CredentialSet,
    ) -> Option<Arc<Session>>;

    /// Replaces the user snapshot of the current session, keeping its
    /// credentials
    ///
    /// Returns the updated session, or `None` if no session is stored.
    fn update_user(&self, user: UserSnapshot) -> Option<Arc<Session>>;

    /// Removes the current session, returning what was removed
    fn clear(&self) -> Option<Arc<Session>>;

    /// Removes the current session, but only if it still holds
    /// `refresh_token`
    ///
    /// Returns what was removed, or `None` if the session was already cleared
    /// or has been replaced by another login.
    fn clear_if(&self, refresh_token: &RefreshTokenRef) -> Option<Arc<Session>>;
}

/// An in-memory credential store built on an atomically swapped pointer
#[derive(Debug, Default)]
pub struct MemoryStore {
    current: ArcSwapOption<Session>,
}

impl MemoryStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store already holding `session`
    pub fn with_session(session: Session) -> Self {
        Self {
            current: ArcSwapOption::from_pointee(session),
        }
    }
}

impl CredentialStore for MemoryStore {
    fn read(&self) -> Option<Arc<Session>> {
        self.current.load_full()
    }

    fn write(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.current.store(Some(session.clone()));
        session
    }

    fn renew(
        &self,
        refresh_token: &RefreshTokenRef,
        credentials: CredentialSet,
    ) -> Option<Arc<Session>> {
        let mut renewed = None;
        self.current.rcu(|current| match current {
            Some(session) if session.credentials().refresh_token() == refresh_token => {
                let next = Arc::new(session.with_credentials(credentials.clone()));
                renewed = Some(next.clone());
                Some(next)
            }
            other => {
                renewed = None;
                other.clone()
            }
        });
        renewed
    }

    fn update_user(&self, user: UserSnapshot) -> Option<Arc<Session>> {
        let mut updated = None;
        self.current.rcu(|current| {
            updated = current
                .as_ref()
                .map(|session| Arc::new(session.with_user(user.clone())));
            updated.clone()
        });
        updated
    }

    fn clear(&self) -> Option<Arc<Session>> {
        self.current.swap(None)
    }

    fn clear_if(&self, refresh_token: &RefreshTokenRef) -> Option<Arc<Session>> {
        let mut removed = None;
        self.current.rcu(|current| match current {
            Some(session) if session.credentials().refresh_token() == refresh_token => {
                removed = Some(session.clone());
                None
            }
            other => {
                removed = None;
                other.clone()
            }
        });
        removed
    }
}
