//! Async completion poller.
//!
//! Some endpoints accept work and finish it later: they answer `202 Accepted` (or a 2xx whose
//! body reports a non-terminal `status`) and expose a status resource. [`Poller::wait`] polls
//! that resource until it reports a terminal state or the wait timeout elapses.
//!
//! Every poll is a full logical request through the [`RetryEngine`], so a 429 or a 5xx while
//! polling is retried under the usual budgets instead of ending the wait.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backoff::Backoff;
use crate::classify::{body_message, request_id};
use crate::clock::{Clock, MonotonicClock};
use crate::config::ConfigError;
use crate::error::{ClassifiedError, Error};
use crate::retry::{Halt, RetryEngine};
use crate::sleeper::sleep_or_cancel;
use crate::transport::RawResponse;

const PENDING_STATES: &[&str] =
    &["pending", "queued", "processing", "in_progress", "running", "accepted"];
const SUCCESS_STATES: &[&str] =
    &["completed", "complete", "succeeded", "success", "done", "finished"];
const FAILURE_STATES: &[&str] = &["failed", "error", "errored", "cancelled", "canceled"];

/// Where an async operation stands, according to its `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Pending,
    Succeeded,
    Failed,
}

impl OperationState {
    /// Map a backend status word. Unknown words yield `None`.
    pub fn from_status(status: &str) -> Option<Self> {
        let status = status.trim().to_ascii_lowercase();
        if PENDING_STATES.contains(&status.as_str()) {
            Some(OperationState::Pending)
        } else if SUCCESS_STATES.contains(&status.as_str()) {
            Some(OperationState::Succeeded)
        } else if FAILURE_STATES.contains(&status.as_str()) {
            Some(OperationState::Failed)
        } else {
            None
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationState::Pending)
    }
}

/// An accepted operation that has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    /// Backend id of the operation, when the body carried one.
    pub id: Option<String>,
    /// Resource to poll.
    pub status_url: Url,
    /// Status reported by the initial response.
    pub status: Option<String>,
    pub request_id: Option<String>,
}

impl PendingOperation {
    /// Inspect a successful response and decide whether it is a pending operation.
    ///
    /// Pending means `202`, or any other 2xx whose JSON `status` is a pending state. The status
    /// URL is taken from `Location`, then the body's `status_url`/`url`, then `{request_url}/{id}`.
    /// Returns `None` for finished results and for pending ones that cannot be located.
    pub fn detect(response: &RawResponse, request_url: &Url) -> Option<Self> {
        if !response.is_success() {
            return None;
        }
        let body: Option<serde_json::Value> = serde_json::from_str(&response.body).ok();
        let status = body.as_ref().and_then(status_field);
        let pending = response.status == 202
            || matches!(
                status.as_deref().and_then(OperationState::from_status),
                Some(OperationState::Pending)
            );
        if !pending {
            return None;
        }

        let id = body.as_ref().and_then(id_field);
        let status_url = locate(response, body.as_ref(), id.as_deref(), request_url);
        let Some(status_url) = status_url else {
            tracing::warn!(
                status = response.status,
                "pending operation has no status location; returning initial response"
            );
            return None;
        };

        Some(Self { id, status_url, status, request_id: request_id(&response.headers) })
    }

    /// Label used in errors: the id when known, otherwise the status URL.
    pub fn label(&self) -> String {
        self.id.clone().unwrap_or_else(|| self.status_url.to_string())
    }
}

fn status_field(body: &serde_json::Value) -> Option<String> {
    body.get("status")
        .or_else(|| body.get("data").and_then(|d| d.get("status")))
        .and_then(|s| s.as_str())
        .map(str::to_string)
}

fn id_field(body: &serde_json::Value) -> Option<String> {
    let id = body.get("id").or_else(|| body.get("data").and_then(|d| d.get("id")))?;
    match id {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn locate(
    response: &RawResponse,
    body: Option<&serde_json::Value>,
    id: Option<&str>,
    request_url: &Url,
) -> Option<Url> {
    let from_body = || {
        let body = body?;
        ["status_url", "url"]
            .iter()
            .find_map(|key| body.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
    };
    if let Some(target) = response.header("location").map(str::to_string).or_else(from_body) {
        return request_url.join(&target).ok();
    }

    let id = id?;
    let mut url = request_url.clone();
    url.set_query(None);
    url.path_segments_mut().ok()?.pop_if_empty().push(id);
    Some(url)
}

/// Poll interval and overall wait timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Backoff,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self { interval: Backoff::constant(Duration::from_secs(2)), timeout: Duration::from_secs(300) }
    }
}

impl PollSettings {
    /// Validate: the timeout and the first interval must both be non-zero.
    pub fn new(interval: Backoff, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::ZeroPollTimeout);
        }
        if interval.delay(1).is_zero() {
            return Err(ConfigError::InvalidPollInterval("interval must be > 0".into()));
        }
        Ok(Self { interval, timeout })
    }

    /// Fixed interval between polls.
    pub fn fixed(interval: Duration, timeout: Duration) -> Result<Self, ConfigError> {
        Self::new(Backoff::constant(interval), timeout)
    }

    /// Doubling interval from `initial`, capped at `max`.
    pub fn exponential(
        initial: Duration,
        max: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let interval = Backoff::capped_exponential(initial, max)
            .map_err(|e| ConfigError::InvalidPollInterval(e.to_string()))?;
        Self::new(interval, timeout)
    }
}

/// Drives the status-poll loop for pending operations.
#[derive(Debug, Clone)]
pub struct Poller {
    settings: PollSettings,
    clock: Arc<dyn Clock>,
}

impl Poller {
    pub fn new(settings: PollSettings) -> Self {
        Self { settings, clock: Arc::new(MonotonicClock::default()) }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub(crate) fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Poll until `operation` reaches a terminal state and return the final status response.
    ///
    /// `fetch` performs exactly one GET of the status URL and returns its classified outcome;
    /// it is invoked through `engine`, so transient failures are retried. The last interval is
    /// shortened so the final poll happens at the deadline rather than after it.
    pub async fn wait<F, Fut>(
        &self,
        engine: &RetryEngine,
        operation: &PendingOperation,
        cancel: &CancellationToken,
        mut fetch: F,
    ) -> Result<RawResponse, Error>
    where
        F: FnMut(Url) -> Fut,
        Fut: Future<Output = Result<RawResponse, ClassifiedError>>,
    {
        let timeout = self.settings.timeout;
        let started = self.clock.now_millis();
        let mut polls: usize = 0;
        let mut last_status = operation.status.clone();

        loop {
            let elapsed = self.elapsed(started);
            if elapsed >= timeout {
                return Err(self.timed_out(operation, elapsed, polls, last_status));
            }

            polls += 1;
            let wait = self.settings.interval.delay(polls).min(timeout - elapsed);
            sleep_or_cancel(engine.sleeper(), wait, cancel).await?;

            // Retries inside one poll may not outlast the wait; a poll at the deadline gets none
            // and is bounded by the transport's own request timeout.
            let remaining = timeout.saturating_sub(self.elapsed(started));
            let poll = engine.execute_within(cancel, Some(remaining), |_| {
                fetch(operation.status_url.clone())
            });
            let outcome = if remaining.is_zero() {
                poll.await
            } else {
                match tokio::time::timeout(remaining, poll).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let waited = self.elapsed(started).max(timeout);
                        return Err(self.timed_out(operation, waited, polls, last_status));
                    }
                }
            };
            let response = match outcome {
                Ok(response) => response,
                Err(Halt::Deadline(err)) => {
                    tracing::debug!(operation = %operation.label(), error = %err, "poll retry would pass the wait timeout");
                    let waited = self.elapsed(started);
                    return Err(self.timed_out(operation, waited, polls, last_status));
                }
                Err(Halt::Failed(err)) => return Err(err),
            };

            let body: Option<serde_json::Value> = serde_json::from_str(&response.body).ok();
            let status = body.as_ref().and_then(status_field);

            match status.as_deref().map(|s| (s, OperationState::from_status(s))) {
                // A body without a status is the finished resource itself.
                None => return Ok(response),
                Some((_, Some(OperationState::Succeeded))) => {
                    tracing::debug!(operation = %operation.label(), polls, "async operation completed");
                    return Ok(response);
                }
                Some((state, Some(OperationState::Failed))) => {
                    return Err(Error::AsyncFailed {
                        operation: operation.label(),
                        status: state.to_string(),
                        message: body_message(&response.body)
                            .unwrap_or_else(|| format!("operation reported {state}")),
                        request_id: request_id(&response.headers)
                            .or_else(|| operation.request_id.clone()),
                    });
                }
                Some((state, _)) => {
                    tracing::debug!(
                        operation = %operation.label(),
                        polls,
                        status = state,
                        "async operation still pending"
                    );
                    last_status = Some(state.to_string());
                }
            }
        }
    }

    fn elapsed(&self, started: u64) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(started))
    }

    fn timed_out(
        &self,
        operation: &PendingOperation,
        waited: Duration,
        polls: usize,
        last_status: Option<String>,
    ) -> Error {
        tracing::warn!(
            operation = %operation.label(),
            waited_ms = waited.as_millis() as u64,
            polls,
            "async operation did not complete in time"
        );
        Error::AsyncTimeout { operation: operation.label(), waited, last_status }
    }
}
