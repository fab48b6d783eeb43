//! Request executor.
//!
//! [`ApiClient::execute`] is the one entry point the command layer uses. Per logical call it:
//! 1. resolves the idempotency key (once, before any attempt),
//! 2. builds the account-scoped URL,
//! 3. runs the attempt loop through the [`RetryEngine`], sending the same key on every attempt,
//! 4. hands a pending async result to the [`Poller`] when the caller asked to wait.
//!
//! It returns either a success payload or an [`Error`], never both.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use url::Url;

use crate::circuit_breaker::CircuitBreaker;
use crate::classify::{classify_response, classify_transport, request_id, truncate_body};
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ClientConfig, ConfigError, RetryOverrides};
use crate::error::{ClassifiedError, Error};
use crate::idempotency::{IdempotencyKey, IdempotencyMode, IDEMPOTENCY_HEADER};
use crate::jitter::Jitter;
use crate::poller::{PendingOperation, PollSettings, Poller};
use crate::retry::RetryEngine;
use crate::sleeper::Sleeper;
use crate::transport::{ApiRequest, RawResponse, ReqwestTransport, Transport};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Whether the call changes server state. `None` infers it from the method.
    pub mutating: Option<bool>,
    pub idempotency: IdempotencyMode,
    /// Wait for async completion with these settings.
    pub wait: Option<PollSettings>,
    /// Budget and delay overrides for this call only.
    pub overrides: Option<RetryOverrides>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mutating(mut self, mutating: bool) -> Self {
        self.mutating = Some(mutating);
        self
    }

    pub fn with_idempotency(mut self, mode: IdempotencyMode) -> Self {
        self.idempotency = mode;
        self
    }

    pub fn with_wait(mut self, settings: PollSettings) -> Self {
        self.wait = Some(settings);
        self
    }

    pub fn with_overrides(mut self, overrides: RetryOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Successful result of a logical call.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub request_id: Option<String>,
    /// Key sent with every attempt of this call, if any.
    pub idempotency_key: Option<IdempotencyKey>,
    /// Set when the backend accepted async work and the caller did not wait for it.
    pub pending: Option<PendingOperation>,
}

impl ApiResponse {
    fn from_raw(
        raw: RawResponse,
        idempotency_key: Option<IdempotencyKey>,
        pending: Option<PendingOperation>,
    ) -> Self {
        Self {
            request_id: request_id(&raw.headers),
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            idempotency_key,
            pending,
        }
    }

    /// Decode the body. An empty body decodes as JSON `null` (so `()` and `Option<T>` work).
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let text = if self.body.trim().is_empty() { "null" } else { self.body.as_str() };
        serde_json::from_str(text).map_err(|source| Error::Decode {
            source,
            body: truncate_body(&self.body),
            request_id: self.request_id.clone(),
        })
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

/// Client for one API installation and account.
///
/// Clones share the transport and circuit breaker.
#[derive(Debug, Clone)]
pub struct ApiClient {
    config: Arc<ClientConfig>,
    transport: Arc<dyn Transport>,
    engine: RetryEngine,
    clock: Arc<dyn Clock>,
}

impl ApiClient {
    /// Build a client with the reqwest transport.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let transport = ReqwestTransport::from_config(&config)
            .map_err(|e| ConfigError::HttpClient(e.message))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Build a client over any transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        config.retry.validate()?;
        let breaker = CircuitBreaker::from_config(&config.retry)?;
        let engine = RetryEngine::new(config.retry.clone(), breaker);
        Ok(Self {
            config: Arc::new(config),
            transport,
            engine,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Time source for breaker cooldowns and async wait deadlines.
    pub fn with_clock<C: Clock + Clone + 'static>(mut self, clock: C) -> Self {
        let breaker = self.engine.breaker().clone().with_clock(clock.clone());
        self.engine = self.engine.with_breaker(breaker);
        self.clock = Arc::new(clock);
        self
    }

    /// Sleeper for backoff and poll intervals.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.engine = self.engine.with_shared_sleeper(Arc::new(sleeper));
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.engine = self.engine.with_jitter(jitter);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.engine.breaker()
    }

    /// Resolve `path` against the installation. Paths starting with `/api/` are used as-is;
    /// anything else is scoped to the configured account.
    pub fn url_for(&self, path: &str) -> Result<Url, ClassifiedError> {
        let invalid = || ClassifiedError::validation("path", path, ["a path such as /conversations"]);
        if path.contains("://") || path.starts_with("//") {
            return Err(invalid());
        }
        let relative = path.trim_start_matches('/');
        let scoped = match self.config.account_id {
            Some(account) if !path.starts_with("/api/") => {
                format!("api/v1/accounts/{account}/{relative}")
            }
            _ => relative.to_string(),
        };
        self.config.base_url.join(&scoped).map_err(|_| invalid())
    }

    /// Execute one logical call.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse, Error> {
        let mutating = options.mutating.unwrap_or_else(|| is_mutating(&method));
        let key = options.idempotency.resolve(mutating)?;
        let url = self.url_for(path)?;
        let engine = self.engine_for(options.overrides.as_ref())?;
        let cancel = options.cancel.clone().unwrap_or_else(CancellationToken::new);

        let span = tracing::info_span!(
            "api_request",
            method = %method,
            path = %path,
            idempotent = key.is_some(),
        );

        let mut request = ApiRequest::new(method, url);
        request.body = body;
        if let Some(key) = &key {
            let invalid = || {
                ClassifiedError::validation("idempotency_key", key.as_str(), Vec::<String>::new())
            };
            let name = HeaderName::from_bytes(IDEMPOTENCY_HEADER.as_bytes()).map_err(|_| invalid())?;
            let value = HeaderValue::from_str(key.as_str()).map_err(|_| invalid())?;
            request.headers.insert(name, value);
        }

        self.run(request, key, engine, options.wait, cancel).instrument(span).await
    }

    async fn run(
        &self,
        request: ApiRequest,
        key: Option<IdempotencyKey>,
        engine: RetryEngine,
        wait: Option<PollSettings>,
        cancel: CancellationToken,
    ) -> Result<ApiResponse, Error> {
        let base_delay = engine.config().rate_limit_base_delay;
        let raw = engine
            .execute(&cancel, |attempt| {
                tracing::debug!(attempt, "sending request");
                self.attempt(&request, base_delay)
            })
            .await?;

        let pending = PendingOperation::detect(&raw, &request.url);
        match (wait, pending) {
            (Some(settings), Some(operation)) => {
                tracing::info!(operation = %operation.label(), "waiting for async operation");
                let poller = Poller::new(settings).with_shared_clock(self.clock.clone());
                let done = poller
                    .wait(&engine, &operation, &cancel, |status_url| {
                        let poll = ApiRequest::new(Method::GET, status_url);
                        async move { self.attempt(&poll, base_delay).await }
                    })
                    .await?;
                Ok(ApiResponse::from_raw(done, key, None))
            }
            (_, pending) => Ok(ApiResponse::from_raw(raw, key, pending)),
        }
    }

    /// Execute and decode the payload.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
        options: RequestOptions,
    ) -> Result<T, Error> {
        self.execute(method, path, body, options).await?.json()
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, Error> {
        self.execute(Method::GET, path, None, RequestOptions::default()).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, Error> {
        self.execute(Method::POST, path, Some(body), RequestOptions::default()).await
    }

    pub async fn put(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, Error> {
        self.execute(Method::PUT, path, Some(body), RequestOptions::default()).await
    }

    pub async fn patch(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, Error> {
        self.execute(Method::PATCH, path, Some(body), RequestOptions::default()).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, Error> {
        self.execute(Method::DELETE, path, None, RequestOptions::default()).await
    }

    /// One HTTP attempt, classified.
    async fn attempt(
        &self,
        request: &ApiRequest,
        rate_limit_base_delay: Duration,
    ) -> Result<RawResponse, ClassifiedError> {
        match self.transport.send(request).await {
            Ok(response) => match classify_response(&response, rate_limit_base_delay) {
                None => Ok(response),
                Some(err) => Err(err),
            },
            Err(err) => Err(classify_transport(&err)),
        }
    }

    fn engine_for(&self, overrides: Option<&RetryOverrides>) -> Result<RetryEngine, Error> {
        let Some(overrides) = overrides else {
            return Ok(self.engine.clone());
        };
        if overrides.touches_breaker() {
            tracing::debug!("breaker overrides only apply when the client is built; ignoring");
        }
        let config = overrides.apply(self.engine.config())?;
        Ok(self.engine.with_config(config))
    }
}

/// POST, PUT, PATCH and DELETE change server state.
pub fn is_mutating(method: &Method) -> bool {
    *method == Method::POST
        || *method == Method::PUT
        || *method == Method::PATCH
        || *method == Method::DELETE
}
