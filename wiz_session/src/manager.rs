use std::{fmt, sync::Arc};

use reqwest_middleware::ClientWithMiddleware;
use tokio::sync::broadcast;
use wiz_clock::{Clock, DurationSecs, System};

use crate::{
    cache::USER_KEY, AuthError, AuthGrant, AuthService, CredentialSet, CredentialStore,
    EndReason, ErrorCode, ExpiryPolicy, HttpAuthService, MemoryStore, NoPersistence, PasswordRef,
    ProviderTokenRef, ReadCache, RefreshCoordinator, Registration, Session, SessionConfig,
    SessionEnded, SessionInvalidator, SessionPersistence, UserSnapshot, UsernameRef,
};

/// Owns the session lifecycle: establishing, restoring, renewing, and ending
/// sessions
///
/// Cloning a manager is cheap and every clone shares the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    service: Arc<dyn AuthService>,
    store: Arc<dyn CredentialStore>,
    persistence: Arc<dyn SessionPersistence>,
    cache: Arc<ReadCache>,
    invalidator: SessionInvalidator,
    coordinator: RefreshCoordinator,
    policy: ExpiryPolicy,
    clock: Arc<dyn Clock + Send + Sync>,
}

/// Assembles a [`SessionManager`]
///
/// Unless overridden, sessions are held in a [`MemoryStore`], nothing is
/// persisted, and time comes from the system clock.
pub struct SessionManagerBuilder {
    service: Arc<dyn AuthService>,
    store: Arc<dyn CredentialStore>,
    persistence: Arc<dyn SessionPersistence>,
    clock: Arc<dyn Clock + Send + Sync>,
    policy: ExpiryPolicy,
    cache_stale_after: DurationSecs,
}

impl SessionManagerBuilder {
    /// Starts a builder for a manager talking to `service`
    pub fn new(service: Arc<dyn AuthService>) -> Self {
        Self {
            service,
            store: Arc::new(MemoryStore::new()),
            persistence: Arc::new(NoPersistence),
            clock: Arc::new(System),
            policy: ExpiryPolicy::default(),
            cache_stale_after: ReadCache::DEFAULT_STALE_AFTER,
        }
    }

    /// Starts a builder for a manager talking to the authentication service
    /// described by `config`
    pub fn from_config(
        config: &SessionConfig,
        client: ClientWithMiddleware,
    ) -> Result<Self, url::ParseError> {
        let service = HttpAuthService::new(client, config.api_base_url())?
            .with_timeout(config.auth_timeout());

        Ok(Self::new(Arc::new(service))
            .with_policy(ExpiryPolicy::new(config.renewal_margin()))
            .with_cache_stale_after(config.cache_stale_after()))
    }

    /// Holds sessions in `store`
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = store;
        self
    }

    /// Persists sessions through `persistence`
    pub fn with_persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Reads time from `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Decides renewal using `policy`
    pub fn with_policy(mut self, policy: ExpiryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Lets cached reads go stale after `stale_after`
    pub fn with_cache_stale_after(mut self, stale_after: DurationSecs) -> Self {
        self.cache_stale_after = stale_after;
        self
    }

    /// Builds the manager
    pub fn build(self) -> SessionManager {
        let cache = Arc::new(ReadCache::with_clock(
            self.cache_stale_after,
            self.clock.clone(),
        ));
        let invalidator =
            SessionInvalidator::new(self.store.clone(), cache.clone(), self.persistence.clone());
        let coordinator = RefreshCoordinator::new(
            self.service.clone(),
            self.store.clone(),
            invalidator.clone(),
            self.clock.clone(),
        );

        SessionManager {
            inner: Arc::new(Inner {
                service: self.service,
                store: self.store,
                persistence: self.persistence,
                cache,
                invalidator,
                coordinator,
                policy: self.policy,
                clock: self.clock,
            }),
        }
    }
}

impl fmt::Debug for SessionManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionManagerBuilder")
            .field("service", &self.service)
            .field("store", &self.store)
            .field("persistence", &self.persistence)
            .field("policy", &self.policy)
            .field("cache_stale_after", &self.cache_stale_after)
            .finish()
    }
}

impl SessionManager {
    /// Starts building a manager talking to `service`
    pub fn builder(service: Arc<dyn AuthService>) -> SessionManagerBuilder {
        SessionManagerBuilder::new(service)
    }

    /// Constructs a manager for the authentication service described by
    /// `config`, holding sessions in memory only
    pub fn from_config(
        config: &SessionConfig,
        client: ClientWithMiddleware,
    ) -> Result<Self, url::ParseError> {
        Ok(SessionManagerBuilder::from_config(config, client)?.build())
    }

    /// Logs in with a username and password
    ///
    /// A failed login leaves any existing session in place.
    pub async fn login(
        &self,
        username: &UsernameRef,
        password: &PasswordRef,
    ) -> Result<Arc<Session>, AuthError> {
        let grant = self.inner.service.login(username, password).await?;
        self.establish(grant).await
    }

    /// Creates an account and logs in to it
    pub async fn register(&self, registration: &Registration) -> Result<Arc<Session>, AuthError> {
        let grant = self.inner.service.register(registration).await?;
        self.establish(grant).await
    }

    /// Logs in by exchanging a Google access token
    ///
    /// The new session is verified by fetching its user. If verification
    /// fails the session is ended with [`EndReason::VerificationFailed`].
    pub async fn login_with_google(
        &self,
        provider_token: &ProviderTokenRef,
    ) -> Result<Arc<Session>, AuthError> {
        let grant = self
            .inner
            .service
            .exchange_provider_token(provider_token)
            .await?;
        let session = self.establish(grant).await?;

        match self
            .inner
            .service
            .current_user(session.credentials().access_token())
            .await
        {
            Ok(user) => self.adopt_user(user).await.ok_or(AuthError::NoSession),
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    "unable to verify exchanged session"
                );
                self.inner
                    .invalidator
                    .invalidate(EndReason::VerificationFailed)
                    .await;
                Err(error)
            }
        }
    }

    /// Logs out
    ///
    /// The authentication service is asked to invalidate the session, but the
    /// local session ends whether or not it agrees. A remote failure is
    /// returned after the local teardown.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let remote = match self.inner.store.read() {
            Some(session) => {
                self.inner
                    .service
                    .logout(session.credentials().access_token())
                    .await
            }
            None => Ok(()),
        };

        if let Err(error) = &remote {
            tracing::warn!(
                error = (error as &dyn std::error::Error),
                "remote logout failed, ending session locally"
            );
        }

        self.inner.invalidator.invalidate(EndReason::LoggedOut).await;
        remote
    }

    /// Restores a persisted session at start-up
    ///
    /// A restored session that is due for renewal is renewed right away. If
    /// that renewal fails transiently the restored session is kept.
    pub async fn restore(&self) -> Option<Arc<Session>> {
        let loaded = match self.inner.persistence.load().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!("no persisted session to restore");
                return None;
            }
            Err(error) => {
                tracing::warn!(
                    error = (&*error as &dyn std::error::Error),
                    "unable to load persisted session"
                );
                return None;
            }
        };

        let session = self.inner.store.write(loaded);
        self.inner.cache.clear();
        self.remember_user(session.user());

        let now = self.inner.clock.now();
        if !self.inner.policy.is_renewal_due(Some(session.credentials()), now) {
            tracing::info!(
                user.id = session.user().id,
                expires_at = session.credentials().expires_at().0,
                "restored persisted session"
            );
            return Some(session);
        }

        tracing::info!(
            user.id = session.user().id,
            "restored persisted session, renewing its access token"
        );
        match self.refresh().await {
            Ok(renewed) => Some(renewed),
            Err(_) => self.inner.store.read(),
        }
    }

    /// The user of the current session, if any
    pub fn current_user(&self) -> Option<UserSnapshot> {
        self.inner.store.read().map(|s| s.user().clone())
    }

    /// The current session, if any, without considering renewal
    pub fn session(&self) -> Option<Arc<Session>> {
        self.inner.store.read()
    }

    /// Fetches the current user from the authentication service and updates
    /// the session's snapshot
    pub async fn refresh_user(&self) -> Result<UserSnapshot, AuthError> {
        let session = self.usable_session().await?.ok_or(AuthError::NoSession)?;
        let service = &self.inner.service;

        let user = match service
            .current_user(session.credentials().access_token())
            .await
        {
            Err(AuthError::Unauthorized { code, .. }) if code.is_renewable() => {
                tracing::debug!(%code, "user fetch refused, renewing access token");
                let renewed = self.refresh().await?;
                match service
                    .current_user(renewed.credentials().access_token())
                    .await
                {
                    Err(error) if error.code().map_or(false, ErrorCode::is_renewable) => {
                        self.inner
                            .invalidator
                            .invalidate(EndReason::RetryRejected)
                            .await;
                        return Err(error);
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        self.adopt_user(user.clone())
            .await
            .ok_or(AuthError::NoSession)?;
        Ok(user)
    }

    /// Replaces the user snapshot of the current session
    ///
    /// Returns the updated session, or `None` if there is no session.
    pub async fn update_user(&self, user: UserSnapshot) -> Option<Arc<Session>> {
        self.adopt_user(user).await
    }

    /// Gets a session whose credentials are fit to attach to a request
    ///
    /// Credentials due for renewal are renewed first. When renewal fails
    /// transiently, the current access token is still used until it actually
    /// expires. Returns `None` when there is no session.
    pub async fn usable_session(&self) -> Result<Option<Arc<Session>>, AuthError> {
        let Some(session) = self.inner.store.read() else {
            return Ok(None);
        };

        let now = self.inner.clock.now();
        if !self.inner.policy.is_renewal_due(Some(session.credentials()), now) {
            return Ok(Some(session));
        }

        tracing::debug!(
            expires_at = session.credentials().expires_at().0,
            now = now.0,
            "access token due for renewal"
        );

        match self.refresh().await {
            Ok(renewed) => Ok(Some(renewed)),
            Err(AuthError::NoSession) => Ok(None),
            Err(error) if error.is_terminal() => Err(error),
            Err(error) if !session.credentials().is_expired_at(self.inner.clock.now()) => {
                tracing::warn!(
                    error = (&error as &dyn std::error::Error),
                    until_expired = session
                        .credentials()
                        .until_expired_at(self.inner.clock.now())
                        .0,
                    "renewal failed, using current access token until it expires"
                );
                Ok(Some(session))
            }
            Err(error) => Err(error),
        }
    }

    /// Renews the access token, joining any renewal already in flight
    pub async fn refresh(&self) -> Result<Arc<Session>, AuthError> {
        self.inner.coordinator.refresh().await
    }

    /// Ends the current session
    pub async fn invalidate(&self, reason: EndReason) -> bool {
        self.inner.invalidator.invalidate(reason).await
    }

    /// Subscribes to session-ended signals
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEnded> {
        self.inner.invalidator.subscribe()
    }

    /// The credential store holding the session
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    /// The cache of reads tied to the session
    pub fn cache(&self) -> &Arc<ReadCache> {
        &self.inner.cache
    }

    /// The renewal policy
    pub fn policy(&self) -> ExpiryPolicy {
        self.inner.policy
    }

    /// The clock used for issuing and expiring credentials
    pub fn clock(&self) -> &Arc<dyn Clock + Send + Sync> {
        &self.inner.clock
    }

    async fn establish(&self, grant: AuthGrant) -> Result<Arc<Session>, AuthError> {
        let credentials = CredentialSet::issue(
            grant.access_token,
            grant.refresh_token,
            self.inner.clock.now(),
            grant.expires_in,
        )?;

        let session = self.inner.store.write(Session::new(credentials, grant.user));
        self.inner.cache.clear();
        self.remember_user(session.user());

        tracing::info!(
            user.id = session.user().id,
            expires_at = session.credentials().expires_at().0,
            "session established"
        );

        self.inner.invalidator.persist(&session).await;
        Ok(session)
    }

    async fn adopt_user(&self, user: UserSnapshot) -> Option<Arc<Session>> {
        let session = self.inner.store.update_user(user)?;
        self.remember_user(session.user());
        self.inner.invalidator.persist(&session).await;
        Some(session)
    }

    fn remember_user(&self, user: &UserSnapshot) {
        match serde_json::to_value(user) {
            Ok(value) => self.inner.cache.insert(USER_KEY, value),
            Err(error) => tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "unable to cache user"
            ),
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("service", &self.inner.service)
            .field("store", &self.inner.store)
            .field("persistence", &self.inner.persistence)
            .field("coordinator", &self.inner.coordinator)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiz_clock::{TestClock, UnixTime};

    use super::*;
    use crate::{
        credentials::fixtures::*,
        persist::fake::MemoryPersistence,
        service::fake::{self, FakeAuthService},
        Password, Username,
    };

    struct Harness {
        manager: SessionManager,
        service: Arc<FakeAuthService>,
        persistence: Arc<MemoryPersistence>,
        clock: TestClock,
    }

    fn harness(service: FakeAuthService, stored: Option<Session>) -> Harness {
        harness_with(service, stored, Arc::default())
    }

    fn harness_with(
        service: FakeAuthService,
        stored: Option<Session>,
        persistence: Arc<MemoryPersistence>,
    ) -> Harness {
        let clock = TestClock::new(NOW);
        let service = Arc::new(service);
        let store = match stored {
            Some(session) => MemoryStore::with_session(session),
            None => MemoryStore::new(),
        };

        let manager = SessionManager::builder(service.clone())
            .with_store(Arc::new(store))
            .with_persistence(persistence.clone())
            .with_clock(Arc::new(clock.clone()))
            .build();

        Harness {
            manager,
            service,
            persistence,
            clock,
        }
    }

    fn access_token(manager: &SessionManager) -> Option<String> {
        manager
            .session()
            .map(|s| s.credentials().access_token().as_str().to_owned())
    }

    mod login {
        use super::*;

        #[tokio::test]
        async fn stores_persists_and_caches_the_session() {
            let h = harness(FakeAuthService::new(), None);

            let session = h
                .manager
                .login(UsernameRef::from_str("ada"), PasswordRef::from_str("pw"))
                .await
                .unwrap();

            assert_eq!(session.credentials().access_token().as_str(), "login-access-1");
            assert_eq!(session.credentials().expires_at(), NOW + DurationSecs(3600));
            assert_eq!(h.manager.current_user(), Some(user()));
            assert_eq!(h.persistence.saved().as_ref(), Some(&*session));
            assert_eq!(
                h.manager.cache().get(USER_KEY).unwrap()["username"],
                json!("ada")
            );
        }

        #[tokio::test]
        async fn drops_reads_cached_for_a_previous_session() {
            let h = harness(FakeAuthService::new(), Some(session("old", NOW, 3600)));
            h.manager.cache().insert("transactions", json!([1, 2]));

            h.manager
                .login(UsernameRef::from_str("ada"), PasswordRef::from_str("pw"))
                .await
                .unwrap();

            assert_eq!(h.manager.cache().get("transactions"), None);
        }

        #[tokio::test]
        async fn failure_keeps_the_existing_session() {
            let service = FakeAuthService {
                login_error: Some(fake::unauthorized(ErrorCode::Other)),
                ..FakeAuthService::new()
            };
            let h = harness(service, Some(session("access-1", NOW, 3600)));

            let error = h
                .manager
                .login(UsernameRef::from_str("ada"), PasswordRef::from_str("wrong"))
                .await
                .unwrap_err();

            assert_eq!(error.code(), Some(ErrorCode::Other));
            assert_eq!(access_token(&h.manager).as_deref(), Some("access-1"));
        }

        #[tokio::test]
        async fn registration_establishes_a_session() {
            let h = harness(FakeAuthService::new(), None);
            let registration = Registration {
                username: Username::from_static("ada"),
                email: None,
                password: Password::from_static("pw"),
            };

            h.manager.register(&registration).await.unwrap();

            assert_eq!(access_token(&h.manager).as_deref(), Some("login-access-1"));
        }
    }

    mod login_with_google {
        use super::*;

        #[tokio::test]
        async fn adopts_the_verified_user() {
            let h = harness(FakeAuthService::new(), None);

            let session = h
                .manager
                .login_with_google(ProviderTokenRef::from_str("google"))
                .await
                .unwrap();

            assert_eq!(session.user().credits, 42);
            assert_eq!(h.manager.current_user().unwrap().credits, 42);
            assert_eq!(h.manager.cache().get(USER_KEY).unwrap()["credits"], json!(42));
            assert_eq!(h.persistence.saved().unwrap().user().credits, 42);
        }

        #[tokio::test]
        async fn failed_verification_ends_the_session() {
            let service = FakeAuthService {
                user_error: Some(fake::unauthorized(ErrorCode::TokenInvalid)),
                ..FakeAuthService::new()
            };
            let h = harness(service, None);
            let mut signals = h.manager.subscribe();

            let error = h
                .manager
                .login_with_google(ProviderTokenRef::from_str("google"))
                .await
                .unwrap_err();

            assert_eq!(error.code(), Some(ErrorCode::TokenInvalid));
            assert!(h.manager.session().is_none());
            assert!(h.persistence.saved().is_none());
            assert_eq!(
                signals.recv().await.unwrap().reason,
                EndReason::VerificationFailed
            );
        }
    }

    mod logout {
        use super::*;

        #[tokio::test]
        async fn ends_the_session_remotely_and_locally() {
            let h = harness(
                FakeAuthService::new(),
                Some(session("access-1", NOW, 3600)),
            );
            let mut signals = h.manager.subscribe();

            h.manager.logout().await.unwrap();

            assert_eq!(h.service.logout_count(), 1);
            assert!(h.manager.session().is_none());
            assert_eq!(signals.recv().await.unwrap().reason, EndReason::LoggedOut);
        }

        #[tokio::test]
        async fn ends_the_local_session_even_when_the_service_fails() {
            let service = FakeAuthService {
                logout_error: Some(fake::server_error()),
                ..FakeAuthService::new()
            };
            let persistence = MemoryPersistence::holding(session("access-1", NOW, 3600));
            let h = harness_with(service, Some(session("access-1", NOW, 3600)), persistence);

            let error = h.manager.logout().await.unwrap_err();

            assert!(matches!(error, AuthError::Rejected { .. }));
            assert!(h.manager.session().is_none());
            assert!(h.persistence.saved().is_none());
        }

        #[tokio::test]
        async fn without_a_session_skips_the_service() {
            let h = harness(FakeAuthService::new(), None);

            h.manager.logout().await.unwrap();

            assert_eq!(h.service.logout_count(), 0);
        }
    }

    mod restore {
        use super::*;

        #[tokio::test]
        async fn loads_a_fresh_session_without_renewing() {
            let persistence = MemoryPersistence::holding(session("access-1", NOW, 3600));
            let h = harness_with(FakeAuthService::new(), None, persistence);

            let restored = h.manager.restore().await.unwrap();

            assert_eq!(restored.credentials().access_token().as_str(), "access-1");
            assert_eq!(h.service.refresh_count(), 0);
            assert!(h.manager.cache().get(USER_KEY).is_some());
        }

        #[tokio::test]
        async fn renews_a_due_session() {
            let persistence = MemoryPersistence::holding(session("access-1", NOW, 60));
            let h = harness_with(
                FakeAuthService::new().then_renew("access-2", 3600),
                None,
                persistence,
            );

            let restored = h.manager.restore().await.unwrap();

            assert_eq!(restored.credentials().access_token().as_str(), "access-2");
            assert_eq!(
                h.persistence
                    .saved()
                    .unwrap()
                    .credentials()
                    .access_token()
                    .as_str(),
                "access-2"
            );
        }

        #[tokio::test]
        async fn keeps_a_due_session_when_renewal_fails_transiently() {
            let persistence = MemoryPersistence::holding(session("access-1", NOW, 60));
            let h = harness_with(
                FakeAuthService::new().then_refresh(Err(fake::server_error())),
                None,
                persistence,
            );

            let restored = h.manager.restore().await.unwrap();

            assert_eq!(restored.credentials().access_token().as_str(), "access-1");
        }

        #[tokio::test]
        async fn drops_a_session_whose_renewal_is_refused() {
            let persistence = MemoryPersistence::holding(session("access-1", NOW, 60));
            let h = harness_with(
                FakeAuthService::new()
                    .then_refresh(Err(fake::unauthorized(ErrorCode::TokenExpired))),
                None,
                persistence,
            );

            assert!(h.manager.restore().await.is_none());
            assert!(h.manager.session().is_none());
            assert!(h.persistence.saved().is_none());
        }

        #[tokio::test]
        async fn with_nothing_persisted_restores_nothing() {
            let h = harness(FakeAuthService::new(), None);

            assert!(h.manager.restore().await.is_none());
        }
    }

    mod usable_session {
        use super::*;

        #[tokio::test]
        async fn without_a_session_is_none() {
            let h = harness(FakeAuthService::new(), None);

            assert!(h.manager.usable_session().await.unwrap().is_none());
            assert_eq!(h.service.refresh_count(), 0);
        }

        #[tokio::test]
        async fn fresh_credentials_are_used_as_is() {
            let h = harness(FakeAuthService::new(), Some(session("access-1", NOW, 3600)));

            let session = h.manager.usable_session().await.unwrap().unwrap();

            assert_eq!(session.credentials().access_token().as_str(), "access-1");
            assert_eq!(h.service.refresh_count(), 0);
        }

        #[tokio::test]
        async fn due_credentials_are_renewed_first() {
            let h = harness(
                FakeAuthService::new().then_renew("access-2", 3600),
                Some(session("access-1", NOW, 1)),
            );

            let session = h.manager.usable_session().await.unwrap().unwrap();

            assert_eq!(session.credentials().access_token().as_str(), "access-2");
            assert_eq!(session.credentials().expires_at(), NOW + DurationSecs(3600));

            h.clock.advance(DurationSecs::from_mins(30));
            let later = h.manager.usable_session().await.unwrap().unwrap();
            assert_eq!(later.credentials().access_token().as_str(), "access-2");
            assert_eq!(h.service.refresh_count(), 1);
        }

        mod when_renewal_fails_transiently {
            use super::*;

            #[tokio::test]
            async fn and_the_token_is_still_valid_it_is_used() {
                let h = harness(
                    FakeAuthService::new().then_refresh(Err(fake::server_error())),
                    Some(session("access-1", NOW, 60)),
                );

                let session = h.manager.usable_session().await.unwrap().unwrap();

                assert_eq!(session.credentials().access_token().as_str(), "access-1");
            }

            #[tokio::test]
            async fn and_the_token_has_expired_the_failure_is_returned() {
                let h = harness(
                    FakeAuthService::new().then_refresh(Err(AuthError::TimedOut)),
                    Some(session("access-1", NOW, 60)),
                );
                h.clock.set(UnixTime(NOW.0 + 60));

                let error = h.manager.usable_session().await.unwrap_err();

                assert!(matches!(error, AuthError::TimedOut));
                assert!(h.manager.session().is_some());
            }
        }

        #[tokio::test]
        async fn terminal_failure_is_returned_and_ends_the_session() {
            let h = harness(
                FakeAuthService::new().then_refresh(Err(fake::unauthorized(ErrorCode::TokenInvalid))),
                Some(session("access-1", NOW, 60)),
            );

            let error = h.manager.usable_session().await.unwrap_err();

            assert_eq!(error.code(), Some(ErrorCode::TokenInvalid));
            assert!(h.manager.session().is_none());
        }
    }

    mod refresh_user {
        use super::*;

        #[tokio::test]
        async fn updates_the_snapshot_and_cache() {
            let h = harness(FakeAuthService::new(), Some(session("access-1", NOW, 3600)));

            let user = h.manager.refresh_user().await.unwrap();

            assert_eq!(user.credits, 42);
            assert_eq!(h.manager.current_user().unwrap().credits, 42);
            assert_eq!(h.manager.cache().get(USER_KEY).unwrap()["credits"], json!(42));
            assert_eq!(access_token(&h.manager).as_deref(), Some("access-1"));
        }

        #[tokio::test]
        async fn without_a_session_fails() {
            let h = harness(FakeAuthService::new(), None);

            let error = h.manager.refresh_user().await.unwrap_err();

            assert!(matches!(error, AuthError::NoSession));
        }

        mod when_the_access_token_is_refused {
            use super::*;

            #[tokio::test]
            async fn the_fetch_is_retried_once_with_renewed_credentials() {
                let h = harness(
                    FakeAuthService::new()
                        .then_user(Err(fake::unauthorized(ErrorCode::TokenExpired)))
                        .then_renew("access-2", 3600),
                    Some(session("access-1", NOW, 3600)),
                );

                let user = h.manager.refresh_user().await.unwrap();

                assert_eq!(user.credits, 42);
                assert_eq!(h.service.refresh_count(), 1);
                assert_eq!(h.service.user_fetch_count(), 2);
                assert_eq!(access_token(&h.manager).as_deref(), Some("access-2"));
                assert_eq!(h.manager.current_user().unwrap().credits, 42);
            }

            #[tokio::test]
            async fn and_refused_again_the_session_ends() {
                let h = harness(
                    FakeAuthService::new()
                        .then_user(Err(fake::unauthorized(ErrorCode::TokenExpired)))
                        .then_user(Err(fake::unauthorized(ErrorCode::TokenInvalid)))
                        .then_renew("access-2", 3600),
                    Some(session("access-1", NOW, 3600)),
                );
                let mut signals = h.manager.subscribe();

                let error = h.manager.refresh_user().await.unwrap_err();

                assert_eq!(error.code(), Some(ErrorCode::TokenInvalid));
                assert_eq!(h.service.refresh_count(), 1);
                assert_eq!(h.service.user_fetch_count(), 2);
                assert!(h.manager.session().is_none());
                assert!(h.persistence.saved().is_none());
                assert_eq!(
                    signals.recv().await.unwrap(),
                    SessionEnded {
                        reason: EndReason::RetryRejected,
                        torn_down: true
                    }
                );
            }
        }
    }

    #[tokio::test]
    async fn update_user_refreshes_the_cache() {
        let h = harness(FakeAuthService::new(), Some(session("access-1", NOW, 3600)));
        let richer = UserSnapshot {
            credits: 500,
            ..user()
        };

        h.manager.update_user(richer).await.unwrap();

        assert_eq!(h.manager.cache().get(USER_KEY).unwrap()["credits"], json!(500));
        assert_eq!(h.persistence.saved().unwrap().user().credits, 500);
    }
}
