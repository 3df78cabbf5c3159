use std::{sync::Arc, time::Duration};

use bytes::{BufMut, BytesMut};
use predicates::Predicate;
use reqwest::{header, Method, Request, Response, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use url::Url;
use wiz_session::{AccessTokenRef, AuthError, EndReason, ErrorEnvelope, Session, SessionManager};

use crate::{ApiError, SameOrigin};

/// Time limits for a single API call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutorConfig {
    deadline: Duration,
    attempt_timeout: Duration,
}

impl Default for ExecutorConfig {
    /// Default time limits
    ///
    /// A call, including any renewal and retry, gets 30 seconds. Each attempt
    /// on the wire gets 10 seconds unless the request sets its own timeout.
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl ExecutorConfig {
    /// Sets the deadline covering the whole call
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Sets the timeout applied to each attempt
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// The deadline covering the whole call
    #[inline]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// The timeout applied to each attempt
    #[inline]
    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }
}

/// What a query does when the user is not authorized
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnauthorizedBehavior {
    /// Answer with `None`
    ReturnNone,
    /// Fail with the authorization error
    Fail,
}

/// Calls the API on behalf of the current session
///
/// Before a request is sent, credentials that are due for renewal are renewed.
/// If the API still answers `401 Unauthorized` with a code that renewal can
/// fix, the credentials are renewed and the request is retried, exactly once.
#[derive(Clone, Debug)]
pub struct ApiClient<P = SameOrigin> {
    client: ClientWithMiddleware,
    base_url: Url,
    manager: SessionManager,
    predicate: P,
    config: ExecutorConfig,
}

impl ApiClient<SameOrigin> {
    /// Constructs a client for the API rooted at `base_url`
    ///
    /// By default, the access token is only attached to requests bound for the
    /// same origin as `base_url`. To change this behavior, provide a custom
    /// predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(client: ClientWithMiddleware, base_url: Url, manager: SessionManager) -> Self {
        let base_url = directory_url(base_url);
        Self {
            client,
            predicate: SameOrigin::new(&base_url),
            base_url,
            manager,
            config: ExecutorConfig::default(),
        }
    }

    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<P>(self, predicate: P) -> ApiClient<P> {
        ApiClient {
            client: self.client,
            base_url: self.base_url,
            manager: self.manager,
            predicate,
            config: self.config,
        }
    }
}

impl<P> ApiClient<P> {
    /// Replaces the default time limits
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// The session manager whose credentials are attached
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// The API base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the API base URL
    ///
    /// Absolute URLs are returned as they are.
    pub fn resolve(&self, path: &str) -> Result<Url, ApiError> {
        match Url::parse(path) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Ok(self.base_url.join(path.trim_start_matches('/'))?)
            }
            Err(error) => Err(error.into()),
        }
    }
}

impl<P> ApiClient<P>
where
    P: Predicate<Request> + Send + Sync,
{
    /// Sends a request, attaching the session's access token
    ///
    /// Only successful responses are returned. Any other status is turned
    /// into an error carrying the message the server sent.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(http.method = %request.method(), http.url = %request.url()),
    )]
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        match tokio::time::timeout(self.config.deadline, self.run(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    deadline_ms = self.config.deadline.as_millis() as u64,
                    "API call did not complete before its deadline"
                );
                Err(ApiError::DeadlineExceeded)
            }
        }
    }

    /// Sends a JSON request to a path relative to the API base URL
    pub async fn api_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Response, ApiError> {
        let url = self.resolve(path)?;
        let mut request = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        self.execute(request.build()?).await
    }

    /// Fetches and decodes a JSON resource
    ///
    /// While a session is present, fresh answers are served from the
    /// session's read cache and new answers are stored there.
    pub async fn query<T: DeserializeOwned>(
        &self,
        path: &str,
        on_unauthorized: UnauthorizedBehavior,
    ) -> Result<Option<T>, ApiError> {
        let key = path.trim_start_matches('/');
        let cache = self.manager.cache();
        let owner = self.manager.session();

        if owner.is_some() {
            if let Some(value) = cache.get(key) {
                tracing::trace!(key, "answering query from cache");
                return serde_json::from_value(value)
                    .map(Some)
                    .map_err(ApiError::Decode);
            }
        }

        let response = match self.api_request(Method::GET, path, None).await {
            Ok(response) => response,
            Err(error)
                if error.is_unauthorized()
                    && on_unauthorized == UnauthorizedBehavior::ReturnNone =>
            {
                tracing::debug!(key, "query not authorized, answering with nothing");
                return Ok(None);
            }
            Err(error) => return Err(error),
        };

        let body = response.bytes().await?;
        let value: serde_json::Value = serde_json::from_slice(&body).map_err(ApiError::Decode)?;
        let decoded = serde_json::from_value(value.clone()).map_err(ApiError::Decode)?;

        // Answers belong to the login that fetched them.
        if let (Some(owner), Some(current)) = (owner, self.manager.session()) {
            if owner.credentials().refresh_token() == current.credentials().refresh_token() {
                cache.insert(key, value);
            }
        }

        Ok(Some(decoded))
    }

    async fn run(&self, mut request: Request) -> Result<Response, ApiError> {
        if request.timeout().is_none() {
            *request.timeout_mut() = Some(self.config.attempt_timeout);
        }

        if request.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!("request carries its own authorization");
            let response = self.client.execute(request).await?;
            return check(response).await;
        }

        let session = if self.predicate.eval(&request) {
            self.manager.usable_session().await?
        } else {
            None
        };

        let Some(session) = session else {
            tracing::trace!("sending request without credentials");
            let response = self.client.execute(request).await?;
            return check(response).await;
        };

        let replay = request.try_clone();
        attach(&mut request, session.credentials().access_token())?;

        let response = self.client.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check(response).await;
        }

        let envelope = ErrorEnvelope::from_response(response).await;
        let Some(code) = envelope.code.filter(|code| code.is_renewable()) else {
            return Err(unauthorized(envelope));
        };
        let Some(mut replay) = replay else {
            tracing::debug!(%code, "request refused, but its body cannot be sent again");
            return Err(unauthorized(envelope));
        };

        tracing::debug!(%code, "request refused, retrying once with renewed credentials");
        let renewed = self.renewed_since(&session).await?;
        attach(&mut replay, renewed.credentials().access_token())?;

        let response = self.client.execute(replay).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let envelope = ErrorEnvelope::from_response(response).await;
            if envelope.is_renewable() {
                tracing::warn!("renewed credentials were refused, ending session");
                self.manager.invalidate(EndReason::RetryRejected).await;
            }
            return Err(unauthorized(envelope));
        }

        check(response).await
    }

    async fn renewed_since(&self, rejected: &Session) -> Result<Arc<Session>, ApiError> {
        if let Some(current) = self.manager.session() {
            let (now, then) = (current.credentials(), rejected.credentials());
            if now.refresh_token() == then.refresh_token()
                && now.access_token() != then.access_token()
            {
                tracing::debug!("credentials were renewed while the request was in flight");
                return Ok(current);
            }
        }

        Ok(self.manager.refresh().await?)
    }
}

fn attach(request: &mut Request, token: &AccessTokenRef) -> Result<(), ApiError> {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());
    let mut value = header::HeaderValue::from_maybe_shared(header_value)
        .map_err(|error| AuthError::MalformedResponse(Arc::new(error)))?;
    value.set_sensitive(true);

    request.headers_mut().insert(header::AUTHORIZATION, value);
    Ok(())
}

async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let envelope = ErrorEnvelope::from_response(response).await;
    if status == StatusCode::UNAUTHORIZED {
        Err(unauthorized(envelope))
    } else {
        Err(ApiError::Rejected {
            status,
            message: envelope.message_or(status.canonical_reason().unwrap_or("request failed")),
        })
    }
}

fn unauthorized(envelope: ErrorEnvelope) -> ApiError {
    ApiError::Unauthorized {
        message: envelope.message_or("unauthorized"),
        code: envelope.code,
    }
}

fn directory_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
