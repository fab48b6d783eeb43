//! Error taxonomy for API calls.
//!
//! [`ClassifiedError`] is the closed set of outcomes a single failed attempt can be sorted into.
//! [`Error`] is what a logical call returns: a classified failure, or one of the outcomes that
//! only exist at the call level (cancellation, async wait problems, decoding, bad config).

use crate::config::ConfigError;
use crate::sleeper::Cancelled;
use std::fmt;
use std::time::Duration;

/// Why a transport-level failure happened, as recovered from the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    ConnectionRefused,
    Dns,
    Tls,
    Timeout,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::ConnectionRefused => "connection refused",
            TransportKind::Dns => "DNS lookup failed",
            TransportKind::Tls => "TLS handshake failed",
            TransportKind::Timeout => "request timed out",
            TransportKind::Other => "network error",
        };
        f.write_str(s)
    }
}

/// Which side of the wire an [`ClassifiedError::Api`] is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiErrorKind {
    /// 4xx other than 401/403/429: the request itself is wrong.
    Client,
    /// 5xx: the backend failed.
    Server,
    /// No HTTP response was received.
    Transport(TransportKind),
}

/// Exactly one of these is produced for every failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifiedError {
    /// HTTP 429.
    #[error("rate limited by the API (retry after {retry_after:?})")]
    RateLimit { retry_after: Duration, request_id: Option<String> },

    /// The client's breaker is open; no request was sent.
    #[error("circuit breaker open after {failures} consecutive backend failures (retry in {retry_in:?})")]
    CircuitBreaker { failures: u32, retry_in: Duration },

    /// HTTP 401/403.
    #[error("authentication failed ({status}): {reason}")]
    Auth { status: u16, reason: String, request_id: Option<String> },

    /// Any other API failure, including transport failures (`status == None`).
    #[error("{}", api_display(.kind, .status, .message))]
    Api {
        kind: ApiErrorKind,
        status: Option<u16>,
        message: String,
        body: String,
        request_id: Option<String>,
    },

    /// Input rejected before anything was sent.
    #[error("{}", validation_display(.field, .value, .allowed))]
    Validation { field: String, value: String, allowed: Vec<String> },
}

fn api_display(kind: &ApiErrorKind, status: &Option<u16>, message: &str) -> String {
    match (kind, status) {
        (ApiErrorKind::Transport(k), _) => format!("{k}: {message}"),
        (ApiErrorKind::Server, Some(code)) => format!("server error {code}: {message}"),
        (_, Some(code)) => format!("API error {code}: {message}"),
        (_, None) => format!("API error: {message}"),
    }
}

fn validation_display(field: &str, value: &str, allowed: &[String]) -> String {
    if allowed.is_empty() {
        format!("invalid value {value:?} for {field}")
    } else {
        format!("invalid value {value:?} for {field} (allowed: {})", allowed.join(", "))
    }
}

impl ClassifiedError {
    /// Build a validation error for a field limited to a set of allowed values.
    pub fn validation<I, S>(field: impl Into<String>, value: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClassifiedError::Validation {
            field: field.into(),
            value: value.into(),
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Backend-assigned correlation id, when the response carried one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClassifiedError::RateLimit { request_id, .. }
            | ClassifiedError::Auth { request_id, .. }
            | ClassifiedError::Api { request_id, .. } => request_id.as_deref(),
            ClassifiedError::CircuitBreaker { .. } | ClassifiedError::Validation { .. } => None,
        }
    }

    /// HTTP status of the failed attempt, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClassifiedError::RateLimit { .. } => Some(429),
            ClassifiedError::Auth { status, .. } => Some(*status),
            ClassifiedError::Api { status, .. } => *status,
            ClassifiedError::CircuitBreaker { .. } | ClassifiedError::Validation { .. } => None,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ClassifiedError::RateLimit { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ClassifiedError::CircuitBreaker { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ClassifiedError::Auth { .. })
    }

    /// 5xx or transport failure: evidence that the backend is unhealthy.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            ClassifiedError::Api { kind: ApiErrorKind::Server | ApiErrorKind::Transport(_), .. }
        )
    }
}

/// Result error of a logical API call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Classified(#[from] ClassifiedError),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The async operation did not reach a terminal state in time.
    #[error("timed out after {waited:?} waiting for operation {operation} to complete")]
    AsyncTimeout { operation: String, waited: Duration, last_status: Option<String> },

    /// The async operation reached a terminal failure state.
    #[error("operation {operation} finished with status {status:?}: {message}")]
    AsyncFailed {
        operation: String,
        status: String,
        message: String,
        request_id: Option<String>,
    },

    /// The success payload could not be decoded.
    #[error("failed to decode response body: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
        request_id: Option<String>,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Self {
        Error::Cancelled
    }
}

impl Error {
    /// Borrow the classified error, if this is one.
    pub fn as_classified(&self) -> Option<&ClassifiedError> {
        match self {
            Error::Classified(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Backend-assigned correlation id, when known.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Error::Classified(e) => e.request_id(),
            Error::AsyncFailed { request_id, .. } | Error::Decode { request_id, .. } => {
                request_id.as_deref()
            }
            Error::Cancelled | Error::AsyncTimeout { .. } | Error::Config(_) => None,
        }
    }
}
