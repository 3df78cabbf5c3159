//! Session-aware API calls over `reqwest`
//!
//! An [`ApiClient`] sends requests on behalf of the session held by a
//! [`SessionManager`](wiz_session::SessionManager). It attaches the current
//! access token as a bearer credential, renews credentials that are about to
//! expire before sending, and when the API refuses a token as expired or
//! invalid it renews the credentials and retries the request exactly once.
//! Renewals are shared: any number of concurrent calls that need fresh
//! credentials wait on the same renewal.
//!
//! If a request already carries an `Authorization` header, the existing value
//! is left in place and the call is never retried.
//!
//! ```
//! use std::sync::Arc;
//!
//! use reqwest::{Client, Method};
//! use reqwest_middleware::ClientBuilder;
//! use wiz_reqwest::{ApiClient, UnauthorizedBehavior};
//! use wiz_session::{SessionConfig, SessionManager, UserSnapshot};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("http://localhost:5000/api/".parse()?);
//! let client = ClientBuilder::new(Client::default()).build();
//! let manager = SessionManager::from_config(&config, client.clone())?;
//!
//! let api = ApiClient::new(client, config.api_base_url().clone(), manager);
//!
//! let user: Option<UserSnapshot> = api.query("user", UnauthorizedBehavior::ReturnNone).await?;
//! let response = api.api_request(Method::POST, "spells/cast", None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Tokens can also be kept to a narrower set of requests by replacing the
//! default same-origin predicate. These predicates can be composed together
//! to evaluate more complex requirements prior to attaching a token to a
//! request.
//!
//! ```
//! # use reqwest::Client;
//! # use reqwest_middleware::ClientBuilder;
//! # use wiz_session::{SessionConfig, SessionManager};
//! use predicates::prelude::PredicateBooleanExt;
//! use wiz_reqwest::{ApiClient, HttpsOnly, SameOrigin};
//!
//! # fn build() -> Result<(), Box<dyn std::error::Error>> {
//! # let base_url: url::Url = "https://api.example.com/".parse()?;
//! # let client = ClientBuilder::new(Client::default()).build();
//! # let manager = SessionManager::from_config(&SessionConfig::new(base_url.clone()), client.clone())?;
//! let api = ApiClient::new(client, base_url.clone(), manager)
//!     .with_predicate(HttpsOnly.and(SameOrigin::new(&base_url)));
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod client;
mod error;
mod predicate;

pub use client::{ApiClient, ExecutorConfig, UnauthorizedBehavior};
pub use error::ApiError;
pub use predicate::{HttpsOnly, SameOrigin};
