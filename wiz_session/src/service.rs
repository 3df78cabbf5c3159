//! The authentication service consumed by the session manager

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;
use wiz_clock::DurationSecs;

use crate::{
    AccessToken, AccessTokenRef, AuthError, ErrorCode, ErrorEnvelope, Password, PasswordRef,
    ProviderTokenRef, RefreshToken, RefreshTokenRef, UserSnapshot, Username, UsernameRef,
};

/// Tokens and user returned by login, registration, and provider exchange
#[derive(Debug, Deserialize, Serialize)]
pub struct AuthGrant {
    /// The authenticated user
    pub user: UserSnapshot,
    /// A new access token
    pub access_token: AccessToken,
    /// A new refresh token
    pub refresh_token: RefreshToken,
    /// How long the access token remains valid
    pub expires_in: DurationSecs,
}

/// A renewed access token
#[derive(Debug, Deserialize, Serialize)]
pub struct RenewalGrant {
    /// The new access token
    pub access_token: AccessToken,
    /// How long the new access token remains valid
    pub expires_in: DurationSecs,
}

/// Details for creating a new account
#[derive(Debug, Serialize)]
pub struct Registration {
    /// The requested login name
    pub username: Username,
    /// An email address for the account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// The account password
    pub password: Password,
}

#[derive(Serialize)]
struct LoginBody<'a> {
    username: &'a UsernameRef,
    password: &'a PasswordRef,
}

#[derive(Serialize)]
struct ProviderBody<'a> {
    access_token: &'a ProviderTokenRef,
}

/// The endpoints offered by an authentication service
#[async_trait]
pub trait AuthService: Send + Sync + fmt::Debug {
    /// Exchanges a username and password for a session
    async fn login(
        &self,
        username: &UsernameRef,
        password: &PasswordRef,
    ) -> Result<AuthGrant, AuthError>;

    /// Creates an account and a session for it
    async fn register(&self, registration: &Registration) -> Result<AuthGrant, AuthError>;

    /// Exchanges an identity provider's access token for a session
    async fn exchange_provider_token(
        &self,
        provider_token: &ProviderTokenRef,
    ) -> Result<AuthGrant, AuthError>;

    /// Obtains a new access token using a refresh token
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<RenewalGrant, AuthError>;

    /// Invalidates the tokens of the session holding `access_token`
    async fn logout(&self, access_token: &AccessTokenRef) -> Result<(), AuthError>;

    /// Fetches the user that `access_token` was issued to
    async fn current_user(&self, access_token: &AccessTokenRef) -> Result<UserSnapshot, AuthError>;
}

#[derive(Clone, Copy, Debug)]
enum Endpoint {
    Login,
    Register,
    RefreshToken,
    Logout,
    Google,
    User,
}

impl Endpoint {
    const ALL: [Endpoint; 6] = [
        Self::Login,
        Self::Register,
        Self::RefreshToken,
        Self::Logout,
        Self::Google,
        Self::User,
    ];

    fn path(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::RefreshToken => "refresh-token",
            Self::Logout => "logout",
            Self::Google => "auth/google",
            Self::User => "user",
        }
    }

    fn method(self) -> Method {
        match self {
            Self::User => Method::GET,
            _ => Method::POST,
        }
    }
}

/// An authentication service reached over HTTP
#[derive(Clone, Debug)]
pub struct HttpAuthService {
    client: ClientWithMiddleware,
    endpoints: Vec<Url>,
    timeout: Duration,
}

impl HttpAuthService {
    /// The default timeout applied to each call
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Constructs a service client rooted at `base_url`
    ///
    /// Endpoint paths are resolved relative to `base_url`, which is treated as
    /// a directory even when it lacks a trailing slash.
    pub fn new(client: ClientWithMiddleware, base_url: &Url) -> Result<Self, url::ParseError> {
        let base = directory_url(base_url);
        let endpoints = Endpoint::ALL
            .iter()
            .map(|endpoint| base.join(endpoint.path()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            client,
            endpoints,
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    /// Sets the timeout applied to each call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request(&self, endpoint: Endpoint) -> RequestBuilder {
        let url = self.endpoints[endpoint as usize].clone();
        self.client
            .request(endpoint.method(), url)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.timeout)
    }

    #[tracing::instrument(
        err,
        skip(self, endpoint, request),
        fields(
            endpoint = endpoint.path(),
            response.status = tracing::field::Empty,
        ),
    )]
    async fn send(
        &self,
        endpoint: Endpoint,
        request: RequestBuilder,
    ) -> Result<reqwest::Response, AuthError> {
        tracing::trace!("calling authentication service");

        let response = request.send().await?;
        let status = response.status();
        tracing::Span::current().record("response.status", status.as_u16());

        if status.is_success() {
            return Ok(response);
        }

        let envelope = ErrorEnvelope::from_response(response).await;
        if status == StatusCode::UNAUTHORIZED {
            Err(AuthError::Unauthorized {
                code: envelope.code.unwrap_or(ErrorCode::Other),
                message: envelope.message_or("unauthorized"),
            })
        } else {
            Err(AuthError::Rejected {
                status,
                message: envelope.message_or(status.canonical_reason().unwrap_or("request failed")),
            })
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        endpoint: Endpoint,
        request: RequestBuilder,
    ) -> Result<T, AuthError> {
        let response = self.send(endpoint, request).await?;
        let body = response.bytes().await.map_err(AuthError::malformed)?;
        serde_json::from_slice(&body).map_err(AuthError::malformed)
    }
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn login(
        &self,
        username: &UsernameRef,
        password: &PasswordRef,
    ) -> Result<AuthGrant, AuthError> {
        let body = LoginBody { username, password };
        self.call(Endpoint::Login, self.request(Endpoint::Login).json(&body))
            .await
    }

    async fn register(&self, registration: &Registration) -> Result<AuthGrant, AuthError> {
        self.call(
            Endpoint::Register,
            self.request(Endpoint::Register).json(registration),
        )
        .await
    }

    async fn exchange_provider_token(
        &self,
        provider_token: &ProviderTokenRef,
    ) -> Result<AuthGrant, AuthError> {
        let body = ProviderBody {
            access_token: provider_token,
        };
        self.call(Endpoint::Google, self.request(Endpoint::Google).json(&body))
            .await
    }

    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<RenewalGrant, AuthError> {
        let request = self
            .request(Endpoint::RefreshToken)
            .bearer_auth(refresh_token.as_str());
        self.call(Endpoint::RefreshToken, request).await
    }

    async fn logout(&self, access_token: &AccessTokenRef) -> Result<(), AuthError> {
        let request = self
            .request(Endpoint::Logout)
            .bearer_auth(access_token.as_str());
        self.send(Endpoint::Logout, request).await?;
        Ok(())
    }

    async fn current_user(&self, access_token: &AccessTokenRef) -> Result<UserSnapshot, AuthError> {
        let request = self.request(Endpoint::User).bearer_auth(access_token.as_str());
        self.call(Endpoint::User, request).await
    }
}

/// Returns `url` with a trailing slash so that relative paths join beneath it
pub(crate) fn directory_url(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use reqwest::{header, Request, Response};
    use reqwest_middleware::{ClientBuilder, Middleware, Next};

    use super::*;

    /// Answers every request with a fixed response, remembering what it saw
    struct CannedServer {
        status: StatusCode,
        body: &'static str,
        seen: Mutex<Vec<(Method, String, Option<String>)>>,
    }

    impl CannedServer {
        fn new(status: StatusCode, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Middleware for CannedServer {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> reqwest_middleware::Result<Response> {
            let auth = req
                .headers()
                .get(header::AUTHORIZATION)
                .map(|v| v.to_str().unwrap().to_owned());
            self.seen
                .lock()
                .unwrap()
                .push((req.method().clone(), req.url().to_string(), auth));

            let response = http::Response::builder()
                .status(self.status)
                .body(self.body)
                .unwrap();
            Ok(response.into())
        }
    }

    fn service(server: Arc<CannedServer>) -> HttpAuthService {
        let client = ClientBuilder::new(reqwest::Client::default())
            .with_arc(server)
            .build();
        HttpAuthService::new(client, &"http://localhost:5000/api".parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn refresh_sends_the_refresh_token_as_bearer() {
        let server = CannedServer::new(
            StatusCode::OK,
            r#"{"access_token": "fresh", "expires_in": 3600}"#,
        );

        let grant = service(server.clone())
            .refresh(RefreshTokenRef::from_str("refresh-1"))
            .await
            .unwrap();

        assert_eq!(grant.access_token.as_str(), "fresh");
        assert_eq!(grant.expires_in, DurationSecs(3600));

        let seen = server.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Method::POST);
        assert_eq!(seen[0].1, "http://localhost:5000/api/refresh-token");
        assert_eq!(seen[0].2.as_deref(), Some("Bearer refresh-1"));
    }

    #[tokio::test]
    async fn login_decodes_the_grant() {
        let server = CannedServer::new(
            StatusCode::OK,
            r#"{
                "user": {"id": 1, "username": "ada", "credits": 3},
                "access_token": "a", "refresh_token": "r", "expires_in": 3600
            }"#,
        );

        let grant = service(server.clone())
            .login(
                UsernameRef::from_str("ada"),
                PasswordRef::from_str("secret"),
            )
            .await
            .unwrap();

        assert_eq!(grant.user.username, "ada");
        assert_eq!(grant.refresh_token.as_str(), "r");
        assert_eq!(server.seen.lock().unwrap()[0].1, "http://localhost:5000/api/login");
    }

    #[tokio::test]
    async fn unauthorized_responses_carry_their_code() {
        let server = CannedServer::new(
            StatusCode::UNAUTHORIZED,
            r#"{"error": "Invalid token", "code": "token_invalid"}"#,
        );

        let error = service(server)
            .refresh(RefreshTokenRef::from_str("refresh-1"))
            .await
            .unwrap_err();

        assert_eq!(error.code(), Some(ErrorCode::TokenInvalid));
        assert!(error.is_terminal());
    }

    #[tokio::test]
    async fn unauthorized_without_a_code_is_other() {
        let server = CannedServer::new(StatusCode::UNAUTHORIZED, r#"{"error": "No token provided"}"#);

        let error = service(server)
            .current_user(AccessTokenRef::from_str("a"))
            .await
            .unwrap_err();

        assert_eq!(error.code(), Some(ErrorCode::Other));
        assert_eq!(error.to_string(), "authentication rejected (other): No token provided");
    }

    #[tokio::test]
    async fn server_errors_are_not_terminal() {
        let server = CannedServer::new(StatusCode::INTERNAL_SERVER_ERROR, "oops");

        let error = service(server)
            .refresh(RefreshTokenRef::from_str("refresh-1"))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            AuthError::Rejected { status: StatusCode::INTERNAL_SERVER_ERROR, .. }
        ));
        assert!(!error.is_terminal());
    }

    #[tokio::test]
    async fn garbage_bodies_are_malformed() {
        let server = CannedServer::new(StatusCode::OK, "<html>");

        let error = service(server)
            .refresh(RefreshTokenRef::from_str("refresh-1"))
            .await
            .unwrap_err();

        assert!(matches!(error, AuthError::MalformedResponse(_)));
    }

    #[test]
    fn base_urls_are_treated_as_directories() {
        let with = directory_url(&"http://h/api/".parse().unwrap());
        let without = directory_url(&"http://h/api".parse().unwrap());

        assert_eq!(with.as_str(), "http://h/api/");
        assert_eq!(without.join("auth/google").unwrap().as_str(), "http://h/api/auth/google");
    }
}
