//! What the command layer shows when a call fails: a process exit code, actionable suggestions
//! and, when the backend assigned one, the request id to quote to support.

use crate::error::{ApiErrorKind, ClassifiedError, Error, TransportKind};

/// Process exit codes, one per outcome class.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const API: i32 = 1;
    pub const VALIDATION: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const RATE_LIMIT: i32 = 4;
    pub const CIRCUIT_BREAKER: i32 = 5;
    pub const ASYNC_TIMEOUT: i32 = 6;
    pub const ASYNC_FAILED: i32 = 7;
    pub const DECODE: i32 = 8;
    pub const CONFIG: i32 = 9;
    /// 128 + SIGINT, as shells report an interrupted command.
    pub const CANCELLED: i32 = 130;
}

impl ClassifiedError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClassifiedError::RateLimit { .. } => exit_code::RATE_LIMIT,
            ClassifiedError::CircuitBreaker { .. } => exit_code::CIRCUIT_BREAKER,
            ClassifiedError::Auth { .. } => exit_code::AUTH,
            ClassifiedError::Validation { .. } => exit_code::VALIDATION,
            ClassifiedError::Api { .. } => exit_code::API,
        }
    }

    /// Next steps for the operator, most useful first.
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            ClassifiedError::RateLimit { retry_after, .. } => vec![
                format!(
                    "The API is rate limiting this token; wait at least {}s and try again.",
                    retry_after.as_secs().max(1)
                ),
                "Raise --max-rate-limit-retries (CWCLI_MAX_RATE_LIMIT_RETRIES) to keep retrying automatically.".into(),
                "Spread bulk operations out or run fewer in parallel.".into(),
            ],
            ClassifiedError::CircuitBreaker { retry_in, .. } => vec![
                "The backend failed repeatedly and requests are paused to let it recover.".into(),
                format!("Wait about {}s before running the command again.", retry_in.as_secs().max(1)),
                "Check the service status page if the problem persists.".into(),
            ],
            ClassifiedError::Auth { status: 403, .. } => vec![
                "The API token is valid but lacks permission for this resource.".into(),
                "Ask an administrator to grant access, or use a token for an account with access.".into(),
            ],
            ClassifiedError::Auth { .. } => vec![
                "Re-authenticate: the API token is missing, invalid or expired.".into(),
                "Generate a new access token from your profile settings and log in again.".into(),
            ],
            ClassifiedError::Validation { field, allowed, .. } => {
                let mut out = vec![format!("Fix the value given for {field}.")];
                if !allowed.is_empty() {
                    out.push(format!("Accepted values: {}.", allowed.join(", ")));
                }
                out
            }
            ClassifiedError::Api { kind, status, .. } => api_suggestions(*kind, *status),
        }
    }
}

fn api_suggestions(kind: ApiErrorKind, status: Option<u16>) -> Vec<String> {
    let lines: &[&str] = match (kind, status) {
        (ApiErrorKind::Transport(TransportKind::Dns), _) => &[
            "The API host name could not be resolved; check the configured base URL.",
            "Verify DNS and network connectivity.",
        ],
        (ApiErrorKind::Transport(TransportKind::Tls), _) => &[
            "The TLS handshake failed; check that the base URL uses the right scheme and host.",
            "A proxy or self-signed certificate may be intercepting the connection.",
        ],
        (ApiErrorKind::Transport(TransportKind::ConnectionRefused), _) => &[
            "The server refused the connection; check the base URL and port.",
            "Make sure the service is running and reachable from this machine.",
        ],
        (ApiErrorKind::Transport(TransportKind::Timeout), _) => &[
            "The request timed out; the server may be overloaded.",
            "Try again, or raise the request timeout.",
        ],
        (ApiErrorKind::Transport(TransportKind::Other), _) => &[
            "The request failed before a response arrived; check network connectivity.",
        ],
        (ApiErrorKind::Server, _) => &[
            "The server failed to handle the request; retry in a moment.",
            "If it keeps failing, contact support and quote the request id.",
        ],
        (_, Some(400)) => &["The request was malformed; check the arguments passed to the command."],
        (_, Some(404)) => &[
            "The resource was not found; check the id and the account it belongs to.",
            "List the resources to find the right id.",
        ],
        (_, Some(409)) => &[
            "The request conflicts with the current state of the resource.",
            "Fetch the latest version and retry, or reuse the same idempotency key if this is a retried create.",
        ],
        (_, Some(422)) => &[
            "The server rejected one or more fields; see the message above for which.",
        ],
        _ => &["The API rejected the request; see the message above for details."],
    };
    lines.iter().map(|s| s.to_string()).collect()
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Classified(e) => e.exit_code(),
            Error::Cancelled => exit_code::CANCELLED,
            Error::AsyncTimeout { .. } => exit_code::ASYNC_TIMEOUT,
            Error::AsyncFailed { .. } => exit_code::ASYNC_FAILED,
            Error::Decode { .. } => exit_code::DECODE,
            Error::Config(_) => exit_code::CONFIG,
        }
    }

    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Error::Classified(e) => e.suggestions(),
            Error::Cancelled => vec!["The operation was cancelled before it finished.".into()],
            Error::AsyncTimeout { operation, .. } => vec![
                format!("Operation {operation} is still running on the server."),
                "Check its status later, or wait longer with a larger --wait-timeout.".into(),
            ],
            Error::AsyncFailed { .. } => vec![
                "The server accepted the operation but it failed while running.".into(),
                "Fix the cause reported above and submit it again.".into(),
            ],
            Error::Decode { .. } => vec![
                "The server response had an unexpected shape; the CLI may be out of date.".into(),
                "Upgrade the CLI, or report the request id to support.".into(),
            ],
            Error::Config(_) => vec!["Fix the configuration value named above.".into()],
        }
    }

    /// Message, request id and suggestions, one per line.
    pub fn render_diagnostic(&self) -> String {
        let mut out = format!("error: {self}");
        if let Some(id) = self.request_id() {
            out.push_str(&format!("\nrequest id: {id}"));
        }
        for hint in self.suggestions() {
            out.push_str("\n  - ");
            out.push_str(&hint);
        }
        out
    }
}
