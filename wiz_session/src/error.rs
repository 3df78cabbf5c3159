//! Errors raised while establishing or renewing a session

use std::{fmt, sync::Arc};

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wiz_clock::DurationSecs;

/// The machine-readable code attached to an authorization failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The credential is past its validity
    TokenExpired,
    /// The credential is malformed or revoked
    TokenInvalid,
    /// Any code this client does not recognize
    #[serde(other)]
    Other,
}

impl ErrorCode {
    /// Whether an unauthorized response carrying this code may be recovered
    /// by renewing the access token
    #[inline]
    pub fn is_renewable(self) -> bool {
        matches!(self, Self::TokenExpired | Self::TokenInvalid)
    }

    /// The wire representation of the code
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error body returned by the server on failure
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// A human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// A machine-readable classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl ErrorEnvelope {
    /// Reads an error envelope out of a failed response
    ///
    /// Bodies that are empty or not JSON produce an empty envelope rather than
    /// an error, so that the status is always surfaced.
    pub async fn from_response(response: reqwest::Response) -> Self {
        match response.bytes().await {
            Ok(body) => serde_json::from_slice(&body).unwrap_or_else(|error| {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "error body was not a JSON envelope"
                );
                Self::default()
            }),
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn std::error::Error),
                    "unable to read error body"
                );
                Self::default()
            }
        }
    }

    /// Whether the envelope marks a failure that renewal could recover
    #[inline]
    pub fn is_renewable(&self) -> bool {
        self.code.map_or(false, ErrorCode::is_renewable)
    }

    /// The server-provided message, or `fallback` if none was sent
    pub fn message_or(&self, fallback: &str) -> String {
        self.error.clone().unwrap_or_else(|| fallback.to_owned())
    }
}

/// A failure talking to the authentication service or renewing a session
///
/// Errors are cheap to clone so that every caller awaiting one renewal can
/// receive the identical failure.
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    /// The request never produced a response
    #[error("unable to reach the authentication service")]
    Network(#[source] Arc<reqwest_middleware::Error>),
    /// The service answered `401 Unauthorized`
    #[error("authentication rejected ({code}): {message}")]
    Unauthorized {
        /// The classification of the rejection
        code: ErrorCode,
        /// The server-provided message
        message: String,
    },
    /// The service answered with some other non-success status
    #[error("authentication service returned {status}: {message}")]
    Rejected {
        /// The response status
        status: StatusCode,
        /// The server-provided message
        message: String,
    },
    /// The response body could not be read or decoded
    #[error("malformed response from the authentication service")]
    MalformedResponse(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),
    /// The service issued a token with no lifetime
    #[error("authentication service issued a token with an unusable lifetime of {lifetime}")]
    InvalidLifetime {
        /// The lifetime reported by the service
        lifetime: DurationSecs,
    },
    /// The call did not finish within its timeout
    #[error("authentication service did not answer in time")]
    TimedOut,
    /// No session is stored, so there is nothing to renew
    #[error("no session is available")]
    NoSession,
    /// The renewal this caller was waiting on ended without an outcome
    #[error("session renewal was abandoned before completing")]
    Abandoned,
}

impl AuthError {
    /// Whether this failure means the session cannot be recovered
    ///
    /// Terminal failures tear down the session. Everything else leaves the
    /// stored credentials in place so a later caller may try again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// The authorization code carried by the failure, if any
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Unauthorized { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn malformed<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::MalformedResponse(Arc::new(error))
    }
}

impl From<reqwest_middleware::Error> for AuthError {
    fn from(error: reqwest_middleware::Error) -> Self {
        let timed_out = matches!(&error, reqwest_middleware::Error::Reqwest(e) if e.is_timeout());
        if timed_out {
            Self::TimedOut
        } else {
            Self::Network(Arc::new(error))
        }
    }
}
