//! Idempotency keys for mutating requests.
//!
//! A key is resolved once per logical operation and attached to every attempt of it, so a
//! backend that deduplicates on the key applies a retried create at most once. Re-resolving
//! per attempt would hand the backend a fresh key each time and defeat that.

use rand::RngCore;
use std::fmt;

use crate::error::ClassifiedError;

/// Request header carrying the key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Prefix of generated keys.
pub const KEY_PREFIX: &str = "cwcli_";

/// Sentinel that asks for a generated key (case-insensitive).
pub const AUTO_SENTINEL: &str = "auto";

const MAX_KEY_LEN: usize = 255;

/// Opaque key shared by all attempts of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// `"cwcli_"` followed by 16 random bytes, hex-encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Self(format!("{KEY_PREFIX}{}", hex::encode(bytes)))
    }

    /// Accept an operator-supplied key verbatim, after checking it can travel in a header.
    pub fn fixed(key: impl Into<String>) -> Result<Self, ClassifiedError> {
        let key = key.into();
        let valid = !key.is_empty()
            && key.len() <= MAX_KEY_LEN
            && key.bytes().all(|b| b.is_ascii_graphic());
        if valid {
            Ok(Self(key))
        } else {
            Err(ClassifiedError::validation(
                "idempotency_key",
                key,
                ["1-255 visible ASCII characters", AUTO_SENTINEL],
            ))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a call wants its idempotency key chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IdempotencyMode {
    /// No key header.
    #[default]
    Off,
    /// Operator-supplied key, reused verbatim.
    Fixed(String),
    /// Generate one key per logical operation.
    Auto,
}

impl IdempotencyMode {
    /// Interpret the operator's flag value: absent/blank → `Off`, `auto` → `Auto`, anything else
    /// is a literal key, kept untrimmed.
    pub fn parse(flag: Option<&str>) -> Self {
        let Some(raw) = flag else {
            return IdempotencyMode::Off;
        };
        match raw.trim() {
            "" => IdempotencyMode::Off,
            v if v.eq_ignore_ascii_case(AUTO_SENTINEL) => IdempotencyMode::Auto,
            _ => IdempotencyMode::Fixed(raw.to_string()),
        }
    }

    /// Decide the key for one logical operation. Call once, before the first attempt.
    ///
    /// Non-mutating operations never get a key, whatever the mode.
    pub fn resolve(&self, mutating: bool) -> Result<Option<IdempotencyKey>, ClassifiedError> {
        if !mutating {
            return Ok(None);
        }
        match self {
            IdempotencyMode::Off => Ok(None),
            IdempotencyMode::Fixed(key) => IdempotencyKey::fixed(key.clone()).map(Some),
            IdempotencyMode::Auto => Ok(Some(IdempotencyKey::generate())),
        }
    }
}
