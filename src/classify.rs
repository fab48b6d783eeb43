//! Error classification: raw attempt outcome → [`ClassifiedError`].
//!
//! | Outcome                         | Classification                         |
//! |---------------------------------|----------------------------------------|
//! | 2xx / 3xx                       | not an error                           |
//! | 429                             | `RateLimit` (`Retry-After` or base)    |
//! | 401, 403                        | `Auth` (reason from body if available) |
//! | 5xx                             | `Api { kind: Server }`                 |
//! | other 4xx                       | `Api { kind: Client }`                 |
//! | no response                     | `Api { kind: Transport(_) }`           |
//!
//! Everything here is pure.

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::time::Duration;

use crate::error::{ApiErrorKind, ClassifiedError, TransportKind};
use crate::transport::{RawResponse, TransportError};

/// Correlation headers checked, in order.
pub const REQUEST_ID_HEADERS: [&str; 2] = ["x-request-id", "x-correlation-id"];

/// Bodies kept inside errors are cut to this many bytes.
pub const MAX_ERROR_BODY: usize = 4096;

/// Classify a completed HTTP exchange. `None` means the attempt succeeded.
pub fn classify_response(
    response: &RawResponse,
    rate_limit_base_delay: Duration,
) -> Option<ClassifiedError> {
    let status = response.status;
    if status < 400 {
        return None;
    }
    let request_id = request_id(&response.headers);

    let classified = match status {
        429 => ClassifiedError::RateLimit {
            retry_after: response
                .header("retry-after")
                .and_then(parse_retry_after)
                .unwrap_or(rate_limit_base_delay),
            request_id,
        },
        401 | 403 => ClassifiedError::Auth {
            status,
            reason: body_message(&response.body).unwrap_or_else(|| default_auth_reason(status)),
            request_id,
        },
        _ => ClassifiedError::Api {
            kind: if status >= 500 { ApiErrorKind::Server } else { ApiErrorKind::Client },
            status: Some(status),
            message: body_message(&response.body).unwrap_or_else(|| canonical_reason(status)),
            body: truncate_body(&response.body),
            request_id,
        },
    };
    Some(classified)
}

/// Classify from a status and body alone, for callers that have no headers.
pub fn classify_status(
    status: u16,
    body: &str,
    rate_limit_base_delay: Duration,
) -> Option<ClassifiedError> {
    classify_response(&RawResponse::new(status, body), rate_limit_base_delay)
}

/// Classify a failure where no HTTP response was received.
pub fn classify_transport(err: &TransportError) -> ClassifiedError {
    ClassifiedError::Api {
        kind: ApiErrorKind::Transport(transport_kind(&err.message, err.timeout, err.connect)),
        status: None,
        message: err.message.clone(),
        body: String::new(),
        request_id: None,
    }
}

/// Sort a transport failure by its message text.
///
/// `connect` alone is not conclusive (DNS and TLS failures are also connect errors), so the
/// message is consulted first and the flags only break ties.
pub fn transport_kind(message: &str, timeout: bool, connect: bool) -> TransportKind {
    const DNS: &[&str] = &[
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
        "temporary failure in name resolution",
    ];
    const TLS: &[&str] = &["certificate", "tls", "ssl", "handshake"];
    const REFUSED: &[&str] = &["connection refused", "actively refused", "econnrefused"];
    const TIMEOUT: &[&str] = &["timed out", "timeout", "deadline has elapsed"];

    let lower = message.to_ascii_lowercase();
    let has = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if has(DNS) {
        TransportKind::Dns
    } else if has(TLS) {
        TransportKind::Tls
    } else if has(REFUSED) {
        TransportKind::ConnectionRefused
    } else if timeout || has(TIMEOUT) {
        TransportKind::Timeout
    } else if connect {
        TransportKind::ConnectionRefused
    } else {
        TransportKind::Other
    }
}

/// Parse a `Retry-After` value given as (possibly fractional) delta-seconds.
///
/// HTTP-date values and negative or non-finite numbers yield `None`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let secs = value.parse::<f64>().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

/// First non-empty correlation header.
pub fn request_id(headers: &HeaderMap) -> Option<String> {
    REQUEST_ID_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    })
}

/// Human-readable message from a JSON error body: `error`, `message`, or the first entry of
/// `errors` (a string or an object with `message`).
pub fn body_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let text = |v: &serde_json::Value| {
        v.as_str().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
    };

    let nested = |v: &serde_json::Value| text(v).or_else(|| v.get("message").and_then(text));

    if let Some(msg) = value.get("error").and_then(nested) {
        return Some(msg);
    }
    if let Some(msg) = value.get("message").and_then(text) {
        return Some(msg);
    }
    value.get("errors")?.as_array()?.first().and_then(nested)
}

fn default_auth_reason(status: u16) -> String {
    if status == 401 {
        "the API token is missing, invalid or expired".to_string()
    } else {
        "the API token does not have permission for this resource".to_string()
    }
}

fn canonical_reason(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unexpected response")
        .to_string()
}

pub(crate) fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_secs(2);

    #[test]
    fn success_statuses_are_not_errors() {
        for status in [200, 201, 202, 204, 304] {
            assert!(classify_status(status, "", BASE).is_none(), "status {status}");
        }
    }

    #[test]
    fn rate_limit_prefers_retry_after_header() {
        let resp = RawResponse::new(429, "").with_header("Retry-After", "7");
        assert_eq!(
            classify_response(&resp, BASE),
            Some(ClassifiedError::RateLimit { retry_after: Duration::from_secs(7), request_id: None })
        );
    }

    #[test]
    fn rate_limit_falls_back_to_base_delay() {
        let resp = RawResponse::new(429, "")
            .with_header("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT")
            .with_header("X-Request-Id", "abc");
        assert_eq!(
            classify_response(&resp, BASE),
            Some(ClassifiedError::RateLimit { retry_after: BASE, request_id: Some("abc".into()) })
        );
        assert_eq!(
            classify_status(429, "", BASE),
            Some(ClassifiedError::RateLimit { retry_after: BASE, request_id: None })
        );
    }

    #[test]
    fn auth_reason_comes_from_body() {
        let err = classify_status(401, r#"{"error":"Invalid Access Token"}"#, BASE).unwrap();
        assert_eq!(
            err,
            ClassifiedError::Auth {
                status: 401,
                reason: "Invalid Access Token".into(),
                request_id: None
            }
        );

        let forbidden = classify_status(403, "<html>nope</html>", BASE).unwrap();
        assert!(matches!(forbidden, ClassifiedError::Auth { status: 403, ref reason, .. }
            if reason.contains("permission")));
    }

    #[test]
    fn server_errors_carry_status_body_and_request_id() {
        let resp = RawResponse::new(502, "upstream down").with_header("x-correlation-id", "c-9");
        match classify_response(&resp, BASE).unwrap() {
            ClassifiedError::Api { kind, status, message, body, request_id } => {
                assert_eq!(kind, ApiErrorKind::Server);
                assert_eq!(status, Some(502));
                assert_eq!(message, "Bad Gateway");
                assert_eq!(body, "upstream down");
                assert_eq!(request_id.as_deref(), Some("c-9"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn other_client_errors_are_client_side() {
        for status in [400, 404, 409, 422] {
            let err = classify_status(status, "", BASE).unwrap();
            assert!(
                matches!(err, ClassifiedError::Api { kind: ApiErrorKind::Client, .. }),
                "status {status} -> {err:?}"
            );
        }
        let err = classify_status(422, r#"{"errors":[{"message":"Email is invalid"}]}"#, BASE);
        assert_eq!(err.unwrap().to_string(), "API error 422: Email is invalid");
    }

    #[test]
    fn request_id_header_precedence() {
        let resp = RawResponse::new(500, "")
            .with_header("X-Correlation-Id", "second")
            .with_header("X-Request-Id", "first");
        assert_eq!(request_id(&resp.headers).as_deref(), Some("first"));
        let blank = RawResponse::new(500, "").with_header("X-Request-Id", " ");
        assert_eq!(request_id(&blank.headers), None);
    }

    #[test]
    fn transport_failures_match_message_patterns() {
        let cases = [
            ("error sending request: dns error: failed to lookup address", TransportKind::Dns),
            ("invalid peer certificate: UnknownIssuer", TransportKind::Tls),
            ("tcp connect error: Connection refused (os error 111)", TransportKind::ConnectionRefused),
            ("operation timed out", TransportKind::Timeout),
            ("connection reset by peer", TransportKind::Other),
        ];
        for (message, expected) in cases {
            assert_eq!(transport_kind(message, false, false), expected, "{message}");
        }
        assert_eq!(transport_kind("error sending request", true, false), TransportKind::Timeout);
        assert_eq!(
            transport_kind("error sending request", false, true),
            TransportKind::ConnectionRefused
        );

        let err = classify_transport(&TransportError::new("Connection refused"));
        assert!(matches!(
            err,
            ClassifiedError::Api {
                kind: ApiErrorKind::Transport(TransportKind::ConnectionRefused),
                status: None,
                ..
            }
        ));
    }

    #[test]
    fn retry_after_parsing() {
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(MAX_ERROR_BODY);
        let err = classify_status(500, &body, BASE).unwrap();
        match err {
            ClassifiedError::Api { body, .. } => {
                assert!(body.len() <= MAX_ERROR_BODY);
                assert!(body.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
