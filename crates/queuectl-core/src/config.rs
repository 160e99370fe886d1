use thiserror::Error;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
}

/// The recognized configuration keys. Anything else is rejected at write
/// time so a typo cannot silently create a dead entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
        }
    }

    pub fn parse(s: &str) -> Result<ConfigKey, ConfigError> {
        match s {
            "max_retries" => Ok(ConfigKey::MaxRetries),
            "backoff_base" => Ok(ConfigKey::BackoffBase),
            other => Err(ConfigError::UnknownKey(other.to_string())),
        }
    }

    /// Both keys hold a small non-negative integer; `backoff_base` must
    /// additionally be at least 1 (a zero base would collapse every delay).
    pub fn validate_value(&self, value: &str) -> Result<u32, ConfigError> {
        let n: u32 = value.parse().map_err(|_| ConfigError::InvalidValue {
            key: self.as_str(),
            reason: format!("expected a non-negative integer, got {value:?}"),
        })?;
        if *self == ConfigKey::BackoffBase && n < 1 {
            return Err(ConfigError::InvalidValue {
                key: self.as_str(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(n)
    }
}
