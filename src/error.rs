use std::sync::Arc;

use thiserror::Error;

use crate::codec::DecodeError;

/// Represents a result type for operations in the flagsync core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the control plane.
///
/// None of these ever reach the host application through the lifecycle API: they are absorbed
/// by the connection manager and the synchronizer and turned into a sync mode transition.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was rejected, the api key is likely invalid.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// The server answered with an unexpected HTTP status.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Response body could not be deserialized.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// An inline notification payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The streaming token returned by the auth service is not usable.
    #[error("invalid streaming token: {0}")]
    InvalidToken(&'static str),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// The synchronizer was stopped before the operation completed.
    #[error("synchronizer stopped")]
    Stopped,
}

impl Error {
    /// Returns `true` when retrying the same request later may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::HttpStatus(status) => *status >= 500,
            Error::Network(_) | Error::Io(_) => true,
            Error::InvalidBaseUrl(_)
            | Error::Unauthorized
            | Error::Json(_)
            | Error::Decode(_)
            | Error::InvalidToken(_)
            | Error::ThreadPanicked
            | Error::Stopped => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

/// Failure classification for an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthError {
    /// `false` for 4xx responses and server-side push kill switch, `true` for 5xx and network
    /// failures.
    pub recoverable: bool,
    /// HTTP status when the server answered at all.
    pub http_status: Option<u16>,
}

/// Failure classification for the streaming link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportError {
    /// `true` for network and 5xx failures, `false` for malformed handshakes and 4xx.
    pub recoverable: bool,
}
