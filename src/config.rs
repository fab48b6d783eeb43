//! Client and retry configuration.
//!
//! [`RetryConfig`] is captured once per client and copied into each call; it is never mutated
//! afterwards. Operator input arrives as a [`RetryOverrides`] (from flags, a config file or the
//! environment) and is layered onto the defaults with [`RetryOverrides::apply`].

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default header carrying the API token.
pub const DEFAULT_TOKEN_HEADER: &str = "api_access_token";

/// Default ceiling on the summed retry sleeps of one call.
pub const DEFAULT_MAX_TOTAL_WAIT: Duration = Duration::from_secs(300);

const ENV_MAX_RATE_LIMIT_RETRIES: &str = "CWCLI_MAX_RATE_LIMIT_RETRIES";
const ENV_MAX_5XX_RETRIES: &str = "CWCLI_MAX_5XX_RETRIES";
const ENV_RATE_LIMIT_BASE_DELAY_MS: &str = "CWCLI_RATE_LIMIT_BASE_DELAY_MS";
const ENV_SERVER_ERROR_RETRY_DELAY_MS: &str = "CWCLI_SERVER_ERROR_RETRY_DELAY_MS";
const ENV_CIRCUIT_BREAKER_THRESHOLD: &str = "CWCLI_CIRCUIT_BREAKER_THRESHOLD";
const ENV_CIRCUIT_BREAKER_RESET_MS: &str = "CWCLI_CIRCUIT_BREAKER_RESET_MS";

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("circuit_breaker_threshold must be >= 1 (got {0})")]
    InvalidBreakerThreshold(u32),
    #[error("max_backoff must be > 0")]
    ZeroMaxBackoff,
    #[error("poll timeout must be > 0")]
    ZeroPollTimeout,
    #[error("invalid poll interval: {0}")]
    InvalidPollInterval(String),
    #[error("environment variable {name} has invalid value {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("api token must not be empty")]
    MissingToken,
    #[error("cannot build http client: {0}")]
    HttpClient(String),
}

/// Retry, backoff and breaker settings for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries allowed after HTTP 429, counted separately from 5xx retries.
    pub max_rate_limit_retries: u32,
    /// Retries allowed after server-side failures.
    pub max_5xx_retries: u32,
    /// First rate-limit backoff; doubles per rate-limit retry.
    pub rate_limit_base_delay: Duration,
    /// First server-error backoff; doubles per 5xx retry.
    pub server_error_retry_delay: Duration,
    /// Consecutive backend failures that open the breaker.
    pub circuit_breaker_threshold: u32,
    /// Cooldown before an open breaker lets a probe through.
    pub circuit_breaker_reset_time: Duration,
    /// Cap on computed exponential delays. A larger `Retry-After` still wins, so only
    /// `max_total_wait` bounds what a server can ask for.
    pub max_backoff: Duration,
    /// Retry transport failures (connection refused, DNS, ...) against the 5xx budget.
    pub retry_transport_errors: bool,
    /// Bound on the total time spent sleeping across all retries of one call. A retry that
    /// would cross it returns the last error instead. `None` removes the bound.
    pub max_total_wait: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 3,
            max_5xx_retries: 3,
            rate_limit_base_delay: Duration::from_secs(1),
            server_error_retry_delay: Duration::from_millis(500),
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_time: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            retry_transport_errors: false,
            max_total_wait: Some(DEFAULT_MAX_TOTAL_WAIT),
        }
    }
}

impl RetryConfig {
    /// Check invariants: threshold >= 1 and a non-zero backoff cap.
    /// Durations are unsigned, so the >= 0 constraint holds by construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::InvalidBreakerThreshold(0));
        }
        if self.max_backoff.is_zero() {
            return Err(ConfigError::ZeroMaxBackoff);
        }
        Ok(())
    }

    /// Settings with no retries and no delays. Handy for tests and `--no-retry` style flags.
    pub fn no_retries() -> Self {
        Self {
            max_rate_limit_retries: 0,
            max_5xx_retries: 0,
            rate_limit_base_delay: Duration::ZERO,
            server_error_retry_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Operator-supplied overrides; every field is optional. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryOverrides {
    pub max_rate_limit_retries: Option<u32>,
    pub max_5xx_retries: Option<u32>,
    pub rate_limit_base_delay_ms: Option<u64>,
    pub server_error_retry_delay_ms: Option<u64>,
    pub circuit_breaker_threshold: Option<u32>,
    pub circuit_breaker_reset_time_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub retry_transport_errors: Option<bool>,
    pub max_total_wait_ms: Option<u64>,
}

impl RetryOverrides {
    /// Read overrides from `CWCLI_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match lookup(name) {
                None => Ok(None),
                Some(raw) if raw.trim().is_empty() => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
            }
        }

        Ok(Self {
            max_rate_limit_retries: parse(&lookup, ENV_MAX_RATE_LIMIT_RETRIES)?,
            max_5xx_retries: parse(&lookup, ENV_MAX_5XX_RETRIES)?,
            rate_limit_base_delay_ms: parse(&lookup, ENV_RATE_LIMIT_BASE_DELAY_MS)?,
            server_error_retry_delay_ms: parse(&lookup, ENV_SERVER_ERROR_RETRY_DELAY_MS)?,
            circuit_breaker_threshold: parse(&lookup, ENV_CIRCUIT_BREAKER_THRESHOLD)?,
            circuit_breaker_reset_time_ms: parse(&lookup, ENV_CIRCUIT_BREAKER_RESET_MS)?,
            ..Self::default()
        })
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn merge(self, other: RetryOverrides) -> Self {
        Self {
            max_rate_limit_retries: other.max_rate_limit_retries.or(self.max_rate_limit_retries),
            max_5xx_retries: other.max_5xx_retries.or(self.max_5xx_retries),
            rate_limit_base_delay_ms: other
                .rate_limit_base_delay_ms
                .or(self.rate_limit_base_delay_ms),
            server_error_retry_delay_ms: other
                .server_error_retry_delay_ms
                .or(self.server_error_retry_delay_ms),
            circuit_breaker_threshold: other
                .circuit_breaker_threshold
                .or(self.circuit_breaker_threshold),
            circuit_breaker_reset_time_ms: other
                .circuit_breaker_reset_time_ms
                .or(self.circuit_breaker_reset_time_ms),
            max_backoff_ms: other.max_backoff_ms.or(self.max_backoff_ms),
            retry_transport_errors: other.retry_transport_errors.or(self.retry_transport_errors),
            max_total_wait_ms: other.max_total_wait_ms.or(self.max_total_wait_ms),
        }
    }

    /// Apply to a base config and validate the result.
    pub fn apply(&self, base: &RetryConfig) -> Result<RetryConfig, ConfigError> {
        let ms = Duration::from_millis;
        let cfg = RetryConfig {
            max_rate_limit_retries: self
                .max_rate_limit_retries
                .unwrap_or(base.max_rate_limit_retries),
            max_5xx_retries: self.max_5xx_retries.unwrap_or(base.max_5xx_retries),
            rate_limit_base_delay: self
                .rate_limit_base_delay_ms
                .map(ms)
                .unwrap_or(base.rate_limit_base_delay),
            server_error_retry_delay: self
                .server_error_retry_delay_ms
                .map(ms)
                .unwrap_or(base.server_error_retry_delay),
            circuit_breaker_threshold: self
                .circuit_breaker_threshold
                .unwrap_or(base.circuit_breaker_threshold),
            circuit_breaker_reset_time: self
                .circuit_breaker_reset_time_ms
                .map(ms)
                .unwrap_or(base.circuit_breaker_reset_time),
            max_backoff: self.max_backoff_ms.map(ms).unwrap_or(base.max_backoff),
            retry_transport_errors: self
                .retry_transport_errors
                .unwrap_or(base.retry_transport_errors),
            max_total_wait: self.max_total_wait_ms.map(ms).or(base.max_total_wait),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Whether any breaker-shaping field is set. Those only take effect at client construction.
    pub fn touches_breaker(&self) -> bool {
        self.circuit_breaker_threshold.is_some() || self.circuit_breaker_reset_time_ms.is_some()
    }
}

/// Everything needed to construct an [`ApiClient`](crate::ApiClient).
///
/// `Debug` output redacts the token.
#[derive(Clone)]
pub struct ClientConfig {
    /// Installation root, e.g. `https://app.example.com/`.
    pub base_url: Url,
    pub api_token: String,
    /// Tenant; account-scoped paths are prefixed with `/api/v1/accounts/{id}`.
    pub account_id: Option<u64>,
    pub token_header: String,
    pub user_agent: String,
    /// Per-attempt transport timeout.
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl ClientConfig {
    pub fn new(base_url: &str, api_token: impl Into<String>) -> Result<Self, ConfigError> {
        let mut base_url = Url::parse(base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "not a base url".into(),
            });
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let api_token = api_token.into();
        if api_token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        Ok(Self {
            base_url,
            api_token,
            account_id: None,
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            user_agent: concat!("cwcli/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_account(mut self, account_id: u64) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Apply operator overrides to the retry settings.
    pub fn with_overrides(mut self, overrides: &RetryOverrides) -> Result<Self, ConfigError> {
        self.retry = overrides.apply(&self.retry)?;
        Ok(self)
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url.as_str())
            .field("api_token", &"<redacted>")
            .field("account_id", &self.account_id)
            .field("token_header", &self.token_header)
            .field("user_agent", &self.user_agent)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}
