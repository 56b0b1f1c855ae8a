//! Configuration types for receivers, reconnection and token renewal.

use crate::error::ConfigurationError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Prefix for environment variable overrides, e.g. `SERVICEBUS__RECEIVER__AUTO_COMPLETE`
pub const ENV_PREFIX: &str = "SERVICEBUS";

/// How the broker treats a message once it has been transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReceiveMode {
    /// Message stays locked on the broker until settled or the lock expires
    #[default]
    PeekLock,
    /// Message is removed as soon as it is transferred
    ReceiveAndDelete,
}

impl fmt::Display for ReceiveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeekLock => write!(f, "peek-lock"),
            Self::ReceiveAndDelete => write!(f, "receive-and-delete"),
        }
    }
}

/// What happens to a settlement that is never acknowledged by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettlementTimeoutPolicy {
    /// Resolve the settlement as successful
    #[default]
    AssumeSuccess,
    /// Fail the settlement with a timeout error
    Fail,
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverOptions {
    pub receive_mode: ReceiveMode,

    /// Maximum number of unsettled messages handled concurrently
    pub max_concurrent_calls: u32,

    /// Complete messages automatically when the handler succeeds
    pub auto_complete: bool,

    /// Total time locks are renewed for each message, 0 disables renewal
    pub max_auto_renew_duration_secs: u64,

    /// Explicit link name; generated when absent
    pub name: Option<String>,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            receive_mode: ReceiveMode::PeekLock,
            max_concurrent_calls: 1,
            auto_complete: false,
            max_auto_renew_duration_secs: 300,
            name: None,
        }
    }
}

impl ReceiverOptions {
    /// Lock renewal only applies to peek-locked messages with a positive window
    pub fn auto_renew_enabled(&self) -> bool {
        self.receive_mode == ReceiveMode::PeekLock && self.max_auto_renew_duration_secs > 0
    }

    pub fn max_auto_renew_duration(&self) -> Duration {
        Duration::from_secs(self.max_auto_renew_duration_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_concurrent_calls must be at least 1".to_string(),
            });
        }

        if matches!(self.name.as_deref(), Some("")) {
            return Err(ConfigurationError::Invalid {
                message: "receiver name must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Batch receive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Upper bound on the time a batch receive waits
    pub max_wait_time_secs: u64,

    /// Time without a new message, after the first one, that ends a batch
    pub idle_timeout_ms: u64,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_wait_time_secs: 60,
            idle_timeout_ms: 1000,
        }
    }
}

impl BatchOptions {
    pub fn max_wait_time(&self) -> Duration {
        Duration::from_secs(self.max_wait_time_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Claim renewal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenOptions {
    /// Renew claims this long before the token expires
    pub renewal_margin_secs: u64,
}

impl Default for TokenOptions {
    fn default() -> Self {
        Self {
            renewal_margin_secs: 900,
        }
    }
}

impl TokenOptions {
    pub fn renewal_margin(&self) -> Duration {
        Duration::from_secs(self.renewal_margin_secs)
    }
}

/// Client configuration shared by every entity of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub receiver: ReceiverOptions,
    pub batch: BatchOptions,

    /// Re-establishment of detached links
    pub reconnect: RetryPolicy,

    /// Retry of individual operations such as sends
    pub operation_retry: RetryPolicy,

    pub token: TokenOptions,
    pub settlement_timeout_policy: SettlementTimeoutPolicy,

    /// Interval of the background sweep over the lock-token store
    pub lock_token_sweep_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            receiver: ReceiverOptions::default(),
            batch: BatchOptions::default(),
            reconnect: RetryPolicy::new(150, Duration::from_secs(15)),
            operation_retry: RetryPolicy::new(3, Duration::from_secs(5)),
            token: TokenOptions::default(),
            settlement_timeout_policy: SettlementTimeoutPolicy::default(),
            lock_token_sweep_interval_secs: 60,
        }
    }
}

impl ClientConfig {
    /// Load configuration from files and the environment.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `config/servicebus.{toml,yaml,json}` when present
    /// 2. `explicit_path` when given (must exist)
    /// 3. `SERVICEBUS__*` environment variables, `__` separating sections
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/servicebus").required(false));

        if let Some(path) = explicit_path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let loaded: Self =
            settings
                .try_deserialize()
                .map_err(|e| ConfigurationError::Parsing {
                    message: e.to_string(),
                })?;

        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.receiver.validate()?;

        if self.reconnect.max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                message: "reconnect.max_attempts must be at least 1".to_string(),
            });
        }

        if self.lock_token_sweep_interval_secs == 0 {
            return Err(ConfigurationError::Invalid {
                message: "lock_token_sweep_interval_secs must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn lock_token_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lock_token_sweep_interval_secs)
    }
}
