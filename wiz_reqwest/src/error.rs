use reqwest::StatusCode;
use thiserror::Error;
use wiz_session::{AuthError, ErrorCode};

/// A failed API call
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a response
    #[error("unable to reach the API")]
    Network(#[source] reqwest_middleware::Error),
    /// The API answered `401 Unauthorized` and the session could not recover
    #[error("not authorized: {message}")]
    Unauthorized {
        /// The classification sent with the rejection, if any
        code: Option<ErrorCode>,
        /// The server-provided message
        message: String,
    },
    /// The API answered with some other non-success status
    #[error("API returned {status}: {message}")]
    Rejected {
        /// The response status
        status: StatusCode,
        /// The server-provided message
        message: String,
    },
    /// The access token could not be renewed
    #[error("unable to renew the session")]
    Refresh(#[from] AuthError),
    /// The call, including any renewal and retry, ran out of time
    #[error("API call did not complete before its deadline")]
    DeadlineExceeded,
    /// The response body was not what the caller expected
    #[error("unable to decode API response")]
    Decode(#[source] serde_json::Error),
    /// The request path could not be resolved against the API base URL
    #[error("invalid API URL")]
    InvalidUrl(#[from] url::ParseError),
}

impl ApiError {
    /// Whether the call failed because the user is not, or is no longer,
    /// authorized
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Unauthorized { .. } => true,
            Self::Refresh(error) => error.is_terminal(),
            _ => false,
        }
    }
}

impl From<reqwest_middleware::Error> for ApiError {
    fn from(error: reqwest_middleware::Error) -> Self {
        Self::Network(error)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(reqwest_middleware::Error::Reqwest(error))
    }
}
