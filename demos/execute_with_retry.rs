//! Walking one client through rate limits, server errors and an open breaker.
//!
//! Runs offline against a scripted transport. Set `CWCLI_LOG=debug` to see the event stream.

use async_trait::async_trait;
use cwcli_resilience::prelude::*;
use cwcli_resilience::{logging, ApiRequest, RawResponse, Transport, TransportError};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Scripted {
    responses: Mutex<VecDeque<RawResponse>>,
}

impl Scripted {
    fn push(&self, response: RawResponse) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(response);
        }
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse, TransportError> {
        let next = self.responses.lock().ok().and_then(|mut q| q.pop_front());
        let response = next.unwrap_or_else(|| RawResponse::new(200, r#"{"id":1}"#));
        println!(
            "   -> {} {} (key: {}) <- {}",
            request.method,
            request.url.path(),
            request.header("idempotency-key").unwrap_or("-"),
            response.status
        );
        Ok(response)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(0);
    println!("=== cwcli-resilience: execute with retry ===\n");

    let transport = Arc::new(Scripted::default());
    let retry = RetryConfig {
        rate_limit_base_delay: Duration::from_millis(50),
        server_error_retry_delay: Duration::from_millis(50),
        circuit_breaker_threshold: 3,
        circuit_breaker_reset_time: Duration::from_secs(60),
        ..RetryConfig::default()
    };
    let config = ClientConfig::new("https://support.example.com", "demo-token")?
        .with_account(1)
        .with_retry(retry);
    let client = ApiClient::with_transport(config, transport.clone())?;

    println!("1. A create that hits a rate limit and a 503 before succeeding");
    transport.push(RawResponse::new(429, "").with_header("Retry-After", "0"));
    transport.push(RawResponse::new(503, r#"{"error":"maintenance"}"#));
    let created = client
        .execute(
            Method::POST,
            "/contacts",
            Some(json!({"name": "Ada"})),
            RequestOptions::new().with_idempotency(IdempotencyMode::Auto),
        )
        .await?;
    println!("   status {} body {}\n", created.status, created.body);

    println!("2. Three server errors in a row open the breaker");
    for _ in 0..3 {
        transport.push(RawResponse::new(500, ""));
    }
    let no_retry = RetryOverrides { max_5xx_retries: Some(0), ..RetryOverrides::default() };
    for _ in 0..4 {
        let result = client
            .execute(
                Method::GET,
                "/conversations",
                None,
                RequestOptions::new().with_overrides(no_retry.clone()),
            )
            .await;
        if let Err(err) = result {
            println!("   exit code {}: {err}", err.exit_code());
        }
    }
    println!("   breaker: {:?}\n", client.breaker().snapshot());

    println!("3. What the operator sees");
    if let Err(err) = client.get("/conversations").await {
        println!("{}", err.render_diagnostic());
    }
    Ok(())
}
