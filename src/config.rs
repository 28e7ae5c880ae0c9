//! Delivery engine configuration.
//!
//! Every timing knob is deployment configuration, not a hardcoded constant.
//! Durations are stored as milliseconds so tests can compress time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum retry attempts per lead before the record goes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay before a retry fires. Constant backoff: the delay never
    /// escalates with attempt count.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// How long to wait for a provider delivery confirmation before
    /// declaring a send undelivered.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// Interval between reconciliation sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Sweep lookback window; records created before it are left alone.
    #[serde(default = "default_sweep_lookback_ms")]
    pub sweep_lookback_ms: u64,
    /// Channel length limit in characters.
    #[serde(default = "default_message_limit")]
    pub message_limit: usize,
    /// Compliance footer appended to every outbound message.
    #[serde(default = "default_compliance_footer")]
    pub compliance_footer: String,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5 * 60 * 1000
}

fn default_delivery_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_sweep_interval_ms() -> u64 {
    15 * 60 * 1000
}

fn default_sweep_lookback_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_message_limit() -> usize {
    160
}

fn default_compliance_footer() -> String {
    " Reply STOP to opt out".to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            sweep_lookback_ms: default_sweep_lookback_ms(),
            message_limit: default_message_limit(),
            compliance_footer: default_compliance_footer(),
        }
    }
}

impl DeliveryConfig {
    /// Parse from a JSON settings value (the embedding app owns file loading).
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
