//! Client-side session management with single-flight credential renewal
//!
//! A client that talks to an API on behalf of a logged-in user has to hold on
//! to an access token, renew it before it expires using a refresh token, and
//! give up cleanly when the authentication service refuses to renew it. This
//! crate does that bookkeeping so callers only need to ask for a usable
//! session.
//!
//! The pieces fit together as follows:
//!
//! * A [`CredentialStore`] holds the current [`Session`]: the access and
//!   refresh tokens, when the access token expires, and a snapshot of the
//!   user it was issued to.
//! * An [`ExpiryPolicy`] decides when a credential is due for renewal. By
//!   default that is five minutes before it expires.
//! * A [`RefreshCoordinator`] performs renewals. However many callers find the
//!   credential due at the same time, the authentication service sees a single
//!   refresh call and every caller receives its outcome.
//! * A [`SessionInvalidator`] tears the session down when renewal is refused,
//!   and broadcasts a [`SessionEnded`] signal so that the application can send
//!   the user back to a login screen.
//! * The [`SessionManager`] ties these together with login, logout, and
//!   restoring a session persisted by a previous run.
//!
//! ```
//! use std::sync::Arc;
//!
//! use wiz_session::{
//!     jitter, spawn_background_renewal, FilePersistence, RenewalBackoff, SessionConfig,
//!     SessionManagerBuilder,
//! };
//! use wiz_clock::DurationSecs;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("http://localhost:5000/api/".parse()?)
//!     .with_renewal_margin(DurationSecs::from_mins(5));
//! let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build();
//!
//! let manager = SessionManagerBuilder::from_config(&config, client)?
//!     .with_persistence(Arc::new(FilePersistence::new("session.json")))
//!     .build();
//!
//! if let Some(session) = manager.restore().await {
//!     tracing::info!(user = %session.user().username, "welcome back");
//! }
//!
//! let renewal = spawn_background_renewal(
//!     manager.clone(),
//!     jitter::RandomLead::new(DurationSecs(30)),
//!     RenewalBackoff::default(),
//! );
//!
//! let mut ended = manager.subscribe();
//! let reason = ended.recv().await?.reason;
//! tracing::info!(%reason, "session ended, please log in again");
//! renewal.abort();
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `file`: Provides [`FilePersistence`], which keeps the session in a local
//!   file readable only by its owner.
//! * `rand`: Provides [`RandomLead`][jitter::RandomLead], which spreads
//!   background renewals out using the random number generator provided by
//!   the [rand] crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod cache;
mod config;
mod coordinator;
mod credentials;
mod error;
mod invalidator;
pub mod jitter;
mod manager;
mod persist;
mod policy;
mod renewal;
mod service;
mod store;

pub use braids::*;
pub use cache::{ReadCache, USER_KEY};
pub use config::SessionConfig;
pub use coordinator::RefreshCoordinator;
pub use credentials::{CredentialSet, Session, UserSnapshot};
pub use error::{AuthError, ErrorCode, ErrorEnvelope};
pub use invalidator::{EndReason, SessionEnded, SessionInvalidator};
pub use manager::{SessionManager, SessionManagerBuilder};
#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub use persist::FilePersistence;
pub use persist::{NoPersistence, PersistError, SessionPersistence};
pub use policy::ExpiryPolicy;
pub use renewal::{spawn_background_renewal, RenewalBackoff};
pub use service::{AuthGrant, AuthService, HttpAuthService, Registration, RenewalGrant};
pub use store::{CredentialStore, MemoryStore};
