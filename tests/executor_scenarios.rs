#![allow(missing_docs)]

mod support;

use cwcli_resilience::prelude::*;
use cwcli_resilience::{
    CircuitState, IdempotencyKey, ManualClock, RawResponse, TrackingSleeper, TransportError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::ScriptedTransport;

fn config(retry: RetryConfig) -> ClientConfig {
    ClientConfig::new("https://support.example.com", "secret-token")
        .unwrap()
        .with_account(1)
        .with_retry(retry)
}

fn client(transport: &ScriptedTransport, retry: RetryConfig) -> (ApiClient, TrackingSleeper) {
    let sleeper = TrackingSleeper::new();
    let client = ApiClient::with_transport(config(retry), Arc::new(transport.clone()))
        .unwrap()
        .with_sleeper(sleeper.clone());
    (client, sleeper)
}

#[tokio::test]
async fn rate_limits_then_success_within_budget() {
    let transport = ScriptedTransport::statuses(&[429, 429]).with_fallback(RawResponse::new(
        200,
        r#"{"id":5,"name":"Ada"}"#,
    ));
    let retry = RetryConfig {
        max_rate_limit_retries: 2,
        rate_limit_base_delay: Duration::ZERO,
        ..RetryConfig::default()
    };
    let (client, _) = client(&transport, retry);

    let contact: serde_json::Value = client
        .execute_json(Method::GET, "/contacts/5", None, RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(transport.calls(), 3);
    assert_eq!(contact, json!({"id": 5, "name": "Ada"}));
}

#[tokio::test]
async fn rate_limit_exhaustion_surfaces_after_budget() {
    let transport = ScriptedTransport::statuses(&[429, 429, 429, 429]);
    let retry = RetryConfig { max_rate_limit_retries: 2, ..RetryConfig::default() };
    let (client, sleeper) = client(&transport, retry);

    let err = client.get("/contacts").await.unwrap_err();

    assert!(err.as_classified().is_some_and(ClassifiedError::is_rate_limit));
    assert_eq!(transport.calls(), 3);
    // No Retry-After header: 1s base, then doubled.
    assert_eq!(sleeper.calls(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    assert_eq!(err.exit_code(), 4);
}

#[tokio::test]
async fn retry_after_header_sets_the_floor() {
    let transport = ScriptedTransport::new(vec![Ok(RawResponse::new(429, "")
        .with_header("Retry-After", "7")
        .with_header("X-Request-Id", "rl-1"))]);
    let (client, sleeper) = client(&transport, RetryConfig::default());

    client.get("/contacts").await.unwrap();

    assert_eq!(sleeper.calls(), vec![Duration::from_secs(7)]);
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_blocks_without_http() {
    let transport = ScriptedTransport::statuses(&[500, 500, 500]);
    let retry = RetryConfig {
        circuit_breaker_threshold: 3,
        max_5xx_retries: 0,
        ..RetryConfig::default()
    };
    let clock = ManualClock::new();
    let (client, _) = client(&transport, retry);
    let client = client.with_clock(clock.clone());

    for _ in 0..3 {
        let err = client.get("/conversations").await.unwrap_err();
        assert_eq!(err.as_classified().and_then(ClassifiedError::status), Some(500));
    }
    assert_eq!(transport.calls(), 3);
    assert_eq!(client.breaker().state(), CircuitState::Open);

    let err = client.get("/conversations").await.unwrap_err();
    assert!(err.as_classified().is_some_and(ClassifiedError::is_circuit_open));
    assert_eq!(transport.calls(), 3, "fourth call must not reach the network");
    assert_eq!(err.exit_code(), 5);

    clock.advance(30_000);
    client.get("/conversations").await.unwrap();
    assert_eq!(transport.calls(), 4, "exactly one probe after the cooldown");
    assert_eq!(client.breaker().state(), CircuitState::Closed);
    assert_eq!(client.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn clones_share_the_breaker_but_clients_do_not() {
    let transport = ScriptedTransport::statuses(&[503, 503]);
    let retry = RetryConfig {
        circuit_breaker_threshold: 2,
        max_5xx_retries: 0,
        ..RetryConfig::default()
    };
    let (first, _) = client(&transport, retry.clone());
    let clone = first.clone();
    let (independent, _) = client(&transport, retry);

    assert!(first.get("/inboxes").await.is_err());
    assert!(clone.get("/inboxes").await.is_err());

    assert_eq!(first.breaker().state(), CircuitState::Open);
    assert_eq!(clone.breaker().state(), CircuitState::Open);
    assert_eq!(independent.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn auth_and_client_errors_are_attempted_once() {
    for status in [401u16, 403, 400, 404, 409, 422] {
        let transport = ScriptedTransport::statuses(&[status]);
        let (client, sleeper) = client(&transport, RetryConfig::default());

        let err = client.get("/conversations/1").await.unwrap_err();

        assert_eq!(transport.calls(), 1, "status {status}");
        assert!(sleeper.calls().is_empty());
        assert_eq!(err.as_classified().and_then(ClassifiedError::status), Some(status));
    }
}

#[tokio::test]
async fn auth_error_carries_body_reason_and_request_id() {
    let transport = ScriptedTransport::new(vec![Ok(RawResponse::new(
        401,
        r#"{"error":"Invalid Access Token"}"#,
    )
    .with_header("X-Request-Id", "req-auth"))]);
    let (client, _) = client(&transport, RetryConfig::default());

    let err = client.get("/profile").await.unwrap_err();

    assert!(matches!(
        err.as_classified(),
        Some(ClassifiedError::Auth { status: 401, reason, .. }) if reason == "Invalid Access Token"
    ));
    assert_eq!(err.request_id(), Some("req-auth"));
    assert_eq!(err.exit_code(), 3);
    assert!(err.render_diagnostic().contains("request id: req-auth"));
}

#[tokio::test]
async fn budgets_are_counted_separately() {
    let transport = ScriptedTransport::statuses(&[429, 502, 429, 502]);
    let retry = RetryConfig {
        max_rate_limit_retries: 2,
        max_5xx_retries: 2,
        ..RetryConfig::no_retries()
    };
    let (client, _) = client(&transport, retry);

    client.get("/reports").await.unwrap();

    assert_eq!(transport.calls(), 5);
}

#[tokio::test]
async fn transport_failures_are_not_retried_unless_enabled() {
    let refused = || -> Result<RawResponse, TransportError> {
        Err(TransportError::new("tcp connect error: Connection refused (os error 111)"))
    };

    let transport = ScriptedTransport::new(vec![refused()]);
    let (client_default, _) = client(&transport, RetryConfig::default());
    let err = client_default.get("/contacts").await.unwrap_err();
    assert!(matches!(
        err.as_classified(),
        Some(ClassifiedError::Api { kind: ApiErrorKind::Transport(_), status: None, .. })
    ));
    assert_eq!(transport.calls(), 1);

    let transport = ScriptedTransport::new(vec![refused(), refused()]);
    let retry = RetryConfig { retry_transport_errors: true, ..RetryConfig::default() };
    let (client_retrying, _) = client(&transport, retry);
    client_retrying.get("/contacts").await.unwrap();
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn per_call_overrides_change_budgets_only() {
    let transport = ScriptedTransport::statuses(&[500, 500, 500]);
    let retry = RetryConfig { circuit_breaker_threshold: 10, ..RetryConfig::default() };
    let (client, _) = client(&transport, retry);
    let overrides = RetryOverrides {
        max_5xx_retries: Some(1),
        circuit_breaker_threshold: Some(1),
        ..RetryOverrides::default()
    };

    let err = client
        .execute(Method::GET, "/contacts", None, RequestOptions::new().with_overrides(overrides))
        .await
        .unwrap_err();

    assert_eq!(err.as_classified().and_then(ClassifiedError::status), Some(500));
    assert_eq!(transport.calls(), 2);
    assert_eq!(client.breaker().threshold(), 10);
    assert_eq!(client.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn idempotency_key_is_stable_across_retries() {
    let transport = ScriptedTransport::statuses(&[503, 429, 502]);
    let (client, _) = client(&transport, RetryConfig::default());

    let response = client
        .execute(
            Method::POST,
            "/contacts",
            Some(json!({"name": "Ada"})),
            RequestOptions::new().with_idempotency(IdempotencyMode::Auto),
        )
        .await
        .unwrap();

    let keys = transport.header_values("idempotency-key");
    assert_eq!(keys.len(), 4);
    let first = keys[0].clone().expect("key on first attempt");
    assert!(first.starts_with("cwcli_"));
    assert!(keys.iter().all(|k| k.as_deref() == Some(first.as_str())));
    assert_eq!(response.idempotency_key.as_ref().map(IdempotencyKey::as_str), Some(first.as_str()));
}

#[tokio::test]
async fn distinct_operations_get_distinct_keys() {
    let transport = ScriptedTransport::new(vec![]);
    let (client, _) = client(&transport, RetryConfig::default());
    let options = RequestOptions::new().with_idempotency(IdempotencyMode::Auto);

    client.execute(Method::POST, "/contacts", Some(json!({})), options.clone()).await.unwrap();
    client.execute(Method::POST, "/contacts", Some(json!({})), options).await.unwrap();

    let keys = transport.header_values("idempotency-key");
    assert_eq!(keys.len(), 2);
    assert_ne!(keys[0], keys[1]);
}

#[tokio::test]
async fn reads_and_disabled_mode_send_no_key() {
    let transport = ScriptedTransport::new(vec![]);
    let (client, _) = client(&transport, RetryConfig::default());

    client
        .execute(
            Method::GET,
            "/contacts",
            None,
            RequestOptions::new().with_idempotency(IdempotencyMode::Auto),
        )
        .await
        .unwrap();
    client.post("/contacts", json!({})).await.unwrap();
    client
        .execute(
            Method::POST,
            "/contacts/search",
            Some(json!({})),
            RequestOptions::new()
                .mutating(false)
                .with_idempotency(IdempotencyMode::Fixed("k-1".into())),
        )
        .await
        .unwrap();

    assert_eq!(transport.header_values("idempotency-key"), vec![None, None, None]);
}

#[tokio::test]
async fn invalid_fixed_key_fails_before_sending() {
    let transport = ScriptedTransport::new(vec![]);
    let (client, _) = client(&transport, RetryConfig::default());

    let err = client
        .execute(
            Method::POST,
            "/contacts",
            Some(json!({})),
            RequestOptions::new().with_idempotency(IdempotencyMode::Fixed("has spaces".into())),
        )
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn requests_are_account_scoped() {
    let transport = ScriptedTransport::new(vec![]);
    let (client, _) = client(&transport, RetryConfig::default());

    client.get("/conversations?status=open").await.unwrap();
    client.get("/api/v1/profile").await.unwrap();

    let urls: Vec<String> = transport.requests().iter().map(|r| r.url.to_string()).collect();
    assert_eq!(
        urls,
        vec![
            "https://support.example.com/api/v1/accounts/1/conversations?status=open",
            "https://support.example.com/api/v1/profile",
        ]
    );
}

#[tokio::test]
async fn decode_failures_keep_the_body() {
    let transport =
        ScriptedTransport::new(vec![]).with_fallback(RawResponse::new(200, r#"{"id":"x"}"#));
    let (client, _) = client(&transport, RetryConfig::default());

    #[derive(Debug, serde::Deserialize)]
    struct Contact {
        #[allow(dead_code)]
        id: u64,
    }

    let err = client
        .execute_json::<Contact>(Method::GET, "/contacts/1", None, RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Decode { ref body, .. } if body == r#"{"id":"x"}"#));
    assert_eq!(err.exit_code(), 8);
}
