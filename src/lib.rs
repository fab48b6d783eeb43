#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # cwcli-resilience
//!
//! Request resilience core for the support-API command-line client.
//!
//! Every API call made by the CLI goes through [`ApiClient::execute`], which
//!
//! - **classifies** each attempt into a closed [`ClassifiedError`] taxonomy,
//! - **retries** rate limits and server errors under independent budgets,
//! - **short-circuits** through a per-client [`CircuitBreaker`] when the backend keeps failing,
//! - **attaches** one stable idempotency key to every attempt of a mutating call,
//! - **waits** for accepted async operations when asked to.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cwcli_resilience::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Error> {
//! let config = ClientConfig::new("https://support.example.com", "token")?.with_account(1);
//! let client = ApiClient::new(config)?;
//!
//! let options = RequestOptions::new().with_idempotency(IdempotencyMode::Auto);
//! let created = client
//!     .execute(Method::POST, "/contacts", Some(json!({ "name": "Ada" })), options)
//!     .await?;
//! println!("{} {}", created.status, created.body);
//! # Ok(())
//! # }
//! ```
//!
//! Failures map to an exit code and remediation text through [`Error::exit_code`] and
//! [`Error::render_diagnostic`].

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod jitter;
pub mod logging;
pub mod poller;
pub mod prelude;
pub mod remediation;
pub mod retry;
pub mod sleeper;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState, Permit};
pub use client::{ApiClient, ApiResponse, RequestOptions};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ClientConfig, ConfigError, RetryConfig, RetryOverrides};
pub use error::{ApiErrorKind, ClassifiedError, Error, TransportKind};
pub use idempotency::{IdempotencyKey, IdempotencyMode};
pub use jitter::Jitter;
pub use poller::{OperationState, PendingOperation, PollSettings, Poller};
pub use retry::{decide, RetryClass, RetryEngine};
pub use sleeper::{Cancelled, InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use transport::{ApiRequest, RawResponse, ReqwestTransport, Transport, TransportError};

pub use reqwest::Method;
pub use tokio_util::sync::CancellationToken;
