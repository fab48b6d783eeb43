//! Convenient re-exports for common client types.
pub use crate::{
    client::{ApiClient, ApiResponse, RequestOptions},
    config::{ClientConfig, RetryConfig, RetryOverrides},
    error::{ApiErrorKind, ClassifiedError, Error},
    idempotency::IdempotencyMode,
    poller::PollSettings,
    CancellationToken, Method,
};
