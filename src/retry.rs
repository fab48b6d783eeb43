//! Retry policy engine.
//!
//! Semantics:
//! - Before every attempt the circuit breaker is asked for a permit; a rejection is returned at
//!   once as `ClassifiedError::CircuitBreaker` and does not touch either retry budget.
//! - Rate-limit retries and server-error retries have independent budgets
//!   (`max_rate_limit_retries`, `max_5xx_retries`), so a burst of 429s cannot use up the
//!   allowance for 5xx and vice versa.
//! - Rate-limit delay: `max(retry_after, min(base · 2^n, cap))`, `n` = rate-limit retries so
//!   far. Server-error delay: `min(base · 2^n, cap)`, `n` = 5xx retries so far. The cap never
//!   drops below the configured base.
//! - Auth, client-side and validation errors are returned after exactly one attempt.
//! - Transport failures count against the breaker and are only retried when
//!   `retry_transport_errors` is set (sharing the 5xx budget).
//! - The cancellation token is checked before every attempt and raced against both the attempt
//!   and every sleep; cancellation surfaces as [`Error::Cancelled`], never as a classified error.
//!
//! Which class an error falls into is decided by the pure function [`decide`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::exponential_delay;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::error::{ApiErrorKind, ClassifiedError, Error};
use crate::jitter::Jitter;
use crate::sleeper::{sleep_or_cancel, Sleeper, TokioSleeper};

/// Retry treatment of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// 429; retry against the rate-limit budget, waiting at least `retry_after`.
    RateLimited { retry_after: Duration },
    /// 5xx; counts toward the breaker, retry against the 5xx budget.
    ServerError,
    /// No response; counts toward the breaker, retried only when configured.
    Transport,
    /// Breaker rejection; return without retrying.
    CircuitOpen,
    /// Retrying cannot change the outcome.
    Fatal,
}

/// Map a classified error to its retry treatment.
pub fn decide(err: &ClassifiedError) -> RetryClass {
    match err {
        ClassifiedError::RateLimit { retry_after, .. } => {
            RetryClass::RateLimited { retry_after: *retry_after }
        }
        ClassifiedError::Api { kind: ApiErrorKind::Server, .. } => RetryClass::ServerError,
        ClassifiedError::Api { kind: ApiErrorKind::Transport(_), .. } => RetryClass::Transport,
        ClassifiedError::CircuitBreaker { .. } => RetryClass::CircuitOpen,
        ClassifiedError::Api { kind: ApiErrorKind::Client, .. }
        | ClassifiedError::Auth { .. }
        | ClassifiedError::Validation { .. } => RetryClass::Fatal,
    }
}

/// Wait before rate-limit retry number `n` (0-based).
pub fn rate_limit_delay(config: &RetryConfig, retry_after: Duration, n: u32) -> Duration {
    let cap = config.max_backoff.max(config.rate_limit_base_delay);
    let backoff = exponential_delay(config.rate_limit_base_delay, n as usize).min(cap);
    retry_after.max(backoff)
}

/// Wait before server-error retry number `n` (0-based).
pub fn server_error_delay(config: &RetryConfig, n: u32) -> Duration {
    let cap = config.max_backoff.max(config.server_error_retry_delay);
    exponential_delay(config.server_error_retry_delay, n as usize).min(cap)
}

/// Why [`RetryEngine::execute_within`] stopped without a value.
#[derive(Debug)]
pub(crate) enum Halt {
    /// The call failed the same way [`RetryEngine::execute`] reports it.
    Failed(Error),
    /// A retry was due, but waiting for it would pass the caller's deadline.
    Deadline(ClassifiedError),
}

impl Halt {
    pub(crate) fn into_error(self) -> Error {
        match self {
            Halt::Failed(err) => err,
            Halt::Deadline(err) => err.into(),
        }
    }
}

/// Drives the attempt loop for one logical call.
///
/// Cheap to clone; clones share the circuit breaker and sleeper.
#[derive(Clone)]
pub struct RetryEngine {
    config: RetryConfig,
    breaker: CircuitBreaker,
    sleeper: Arc<dyn Sleeper>,
    jitter: Jitter,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("config", &self.config)
            .field("breaker", &self.breaker.snapshot())
            .field("jitter", &self.jitter)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl RetryEngine {
    pub fn new(config: RetryConfig, breaker: CircuitBreaker) -> Self {
        Self { config, breaker, sleeper: Arc::new(TokioSleeper), jitter: Jitter::None }
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub(crate) fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Same breaker and sleeper, different budgets/delays. Used for per-call overrides.
    pub fn with_config(&self, config: RetryConfig) -> Self {
        Self { config, ..self.clone() }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub(crate) fn sleeper(&self) -> &dyn Sleeper {
        self.sleeper.as_ref()
    }

    /// Run `attempt` until it succeeds, fails in a non-retryable way, or a budget runs out.
    ///
    /// `attempt` receives the 1-based attempt number and must perform exactly one request,
    /// returning its classified outcome.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, attempt: F) -> Result<T, Error>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        self.execute_within(cancel, None, attempt).await.map_err(Halt::into_error)
    }

    /// Like [`execute`](Self::execute), but a retry whose accumulated wait would pass
    /// `deadline` stops the loop with [`Halt::Deadline`] instead of sleeping.
    pub(crate) async fn execute_within<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
        mut attempt: F,
    ) -> Result<T, Halt>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let mut attempts: u32 = 0;
        let mut rate_limit_retries: u32 = 0;
        let mut server_retries: u32 = 0;
        let mut waited = Duration::ZERO;

        loop {
            if cancel.is_cancelled() {
                return Err(Halt::Failed(Error::Cancelled));
            }
            let permit = self.breaker.try_acquire().map_err(|e| Halt::Failed(e.into()))?;
            attempts += 1;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Halt::Failed(Error::Cancelled)),
                outcome = attempt(attempts) => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    self.breaker.record_success(permit);
                    if attempts > 1 {
                        tracing::debug!(attempts, "request succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let delay = match decide(&err) {
                RetryClass::RateLimited { retry_after } => {
                    drop(permit);
                    if rate_limit_retries >= self.config.max_rate_limit_retries {
                        tracing::warn!(attempts, retries = rate_limit_retries, "rate limit retries exhausted");
                        return Err(Halt::Failed(err.into()));
                    }
                    let delay = rate_limit_delay(&self.config, retry_after, rate_limit_retries);
                    rate_limit_retries += 1;
                    delay
                }
                RetryClass::ServerError => {
                    self.breaker.record_failure(permit);
                    if server_retries >= self.config.max_5xx_retries {
                        tracing::warn!(attempts, retries = server_retries, "server error retries exhausted");
                        return Err(Halt::Failed(err.into()));
                    }
                    let delay = server_error_delay(&self.config, server_retries);
                    server_retries += 1;
                    delay
                }
                RetryClass::Transport => {
                    self.breaker.record_failure(permit);
                    if !self.config.retry_transport_errors
                        || server_retries >= self.config.max_5xx_retries
                    {
                        return Err(Halt::Failed(err.into()));
                    }
                    let delay = server_error_delay(&self.config, server_retries);
                    server_retries += 1;
                    delay
                }
                RetryClass::CircuitOpen | RetryClass::Fatal => {
                    drop(permit);
                    return Err(Halt::Failed(err.into()));
                }
            };

            let delay = self.jitter.apply(delay);
            if deadline.is_some_and(|limit| waited.saturating_add(delay) > limit) {
                tracing::debug!(
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retry would pass the caller's deadline"
                );
                return Err(Halt::Deadline(err));
            }

            if let Some(limit) = self.config.max_total_wait {
                if waited.saturating_add(delay) > limit {
                    tracing::warn!(
                        attempts,
                        waited_ms = waited.as_millis() as u64,
                        limit_ms = limit.as_millis() as u64,
                        "retry wait budget exhausted"
                    );
                    return Err(Halt::Failed(err.into()));
                }
            }

            tracing::warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                status = err.status(),
                request_id = err.request_id(),
                error = %err,
                "retrying request"
            );
            sleep_or_cancel(self.sleeper.as_ref(), delay, cancel)
                .await
                .map_err(|e| Halt::Failed(e.into()))?;
            waited = waited.saturating_add(delay);
        }
    }
}
