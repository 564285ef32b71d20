//! Orca Configuration
//!
//! Tunables for the session store, the coordinator and the drain controller.
//! Every field has a default so partial TOML files deserialize cleanly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrcaConfig {
    /// Session store configuration
    pub store: StoreConfig,

    /// Coordinator configuration
    pub coordinator: CoordinatorConfig,

    /// Shutdown drain configuration
    pub drain: DrainConfig,
}

/// Session store configuration.
///
/// A TTL of 0 means "no expiry".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// TTL for session records in seconds (default: 604800 = 7 days)
    pub session_ttl_secs: u64,

    /// TTL for subject profile snapshots in seconds (default: 0 = no expiry)
    pub profile_ttl_secs: u64,

    /// TTL for derived patterns in seconds (default: 86400 = 24 hours)
    pub pattern_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 604_800, // 7 days
            profile_ttl_secs: 0,
            pattern_ttl_secs: 86_400, // 24 hours
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Default per-provider timeout in milliseconds (default: 10000)
    pub provider_timeout_ms: u64,

    /// Global session timeout in milliseconds (default: 30000)
    pub session_timeout_ms: u64,

    /// Maximum sessions running at once (default: 16)
    pub max_concurrent_sessions: usize,

    /// Maximum provider tasks in flight across all sessions (default: 64)
    pub max_inflight_providers: usize,

    /// How long a new session waits for a free slot (default: 5000)
    pub admission_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            provider_timeout_ms: 10_000,
            session_timeout_ms: 30_000,
            max_concurrent_sessions: 16,
            max_inflight_providers: 64,
            admission_timeout_ms: 5_000,
        }
    }
}

impl CoordinatorConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }
}

/// Shutdown drain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Hard deadline for Draining + Finalizing in milliseconds (default: 15000)
    pub hard_deadline_ms: u64,

    /// Time in-flight sessions get to settle on their own before being
    /// closed with partial results (default: 3000)
    pub settle_grace_ms: u64,

    /// Write attempts per drained session after the first (default: 3)
    pub finalize_retries: u32,

    /// Delay between finalize write attempts in milliseconds (default: 200)
    pub retry_backoff_ms: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            hard_deadline_ms: 15_000,
            settle_grace_ms: 3_000,
            finalize_retries: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl DrainConfig {
    pub fn hard_deadline(&self) -> Duration {
        Duration::from_millis(self.hard_deadline_ms)
    }

    pub fn settle_grace(&self) -> Duration {
        Duration::from_millis(self.settle_grace_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl OrcaConfig {
    /// Set store configuration
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set coordinator configuration
    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Set drain configuration
    pub fn with_drain(mut self, drain: DrainConfig) -> Self {
        self.drain = drain;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let c = &self.coordinator;
        non_zero("coordinator.provider_timeout_ms", c.provider_timeout_ms)?;
        non_zero("coordinator.session_timeout_ms", c.session_timeout_ms)?;
        non_zero("coordinator.max_concurrent_sessions", c.max_concurrent_sessions as u64)?;
        non_zero("coordinator.max_inflight_providers", c.max_inflight_providers as u64)?;

        let d = &self.drain;
        non_zero("drain.hard_deadline_ms", d.hard_deadline_ms)?;
        if d.settle_grace_ms > d.hard_deadline_ms {
            return Err(ConfigValidationError::InvalidValue {
                field: "drain.settle_grace_ms".into(),
                message: "must not exceed drain.hard_deadline_ms".into(),
            });
        }

        Ok(())
    }
}

fn non_zero(field: &str, value: u64) -> Result<(), ConfigValidationError> {
    if value == 0 {
        return Err(ConfigValidationError::InvalidValue {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
    Ok(())
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
