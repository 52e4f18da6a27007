//! Tunables for every component. Each component takes its own section by
//! value when it is built and never looks at the others.
//!
//! All sections deserialize from JSON with every field optional, so a config
//! file only needs to name what it changes:
//!
//! ```json
//! { "tracker": { "history_width": 10 }, "negotiator": { "roundtrip_limit": 3 } }
//! ```

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{Error, Result};

/// Active queue capacity used when a gateway is configured with zero.
pub const DEFAULT_ACTIVE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct Config {
    #[builder(default)]
    pub tracker: TrackerConfig,
    #[builder(default)]
    pub analyzer: AnalyzerConfig,
    #[builder(default)]
    pub gateway: GatewayConfig,
    #[builder(default)]
    pub manager: ManagerConfig,
    #[builder(default)]
    pub negotiator: NegotiatorConfig,
    #[builder(default)]
    pub transmuter: TransmuterConfig,
    #[builder(default)]
    pub requests: RequestConfig,
    #[builder(default)]
    pub listener: ListenerConfig,
}

impl Config {
    /// Reads a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read(path)?;
        serde_json::from_slice(&raw).map_err(Error::Config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(Error::Config)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct TrackerConfig {
    /// How often raw request counters are folded into load history.
    #[builder(default = 60_000)]
    pub frequency_calculation_period_ms: u64,
    /// Number of folded datapoints averaged into a dataspace's load.
    #[builder(default = 50)]
    pub history_width: usize,
    /// Number of debrief datapoints averaged into a preferred load.
    #[builder(default = 50)]
    pub preference_history_width: usize,
}

impl TrackerConfig {
    pub fn frequency_calculation_period(&self) -> Duration {
        Duration::from_millis(self.frequency_calculation_period_ms)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct AnalyzerConfig {
    #[builder(default = 60_000)]
    pub distance_poll_time_ms: u64,
    /// Load a single member is assumed to carry when its swarm hasn't
    /// reported a preference.
    #[builder(default = 1)]
    pub default_preferred_load: u64,
    /// Softens the fit score. Larger values need a larger distance before a
    /// swarm scores far from a perfect fit.
    #[builder(default = 10)]
    pub increment_modifier: u64,
    /// Smallest swarm that may be split.
    #[builder(default = 50)]
    pub split_size_limit: usize,
    /// How far from a perfect fit (0.5) a swarm must score to be split.
    #[builder(default = 0.3)]
    pub split_validity_limit: f64,
    /// How far from 1.0 two fit scores may sum and still be merged.
    #[builder(default = 0.3)]
    pub merge_validity_limit: f64,
}

impl AnalyzerConfig {
    pub fn distance_poll_time(&self) -> Duration {
        Duration::from_millis(self.distance_poll_time_ms)
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct GatewayConfig {
    /// Live connections kept ready to hand out. Zero means
    /// [`DEFAULT_ACTIVE_CAPACITY`].
    #[builder(default = DEFAULT_ACTIVE_CAPACITY)]
    pub active_capacity: usize,
}

impl GatewayConfig {
    pub fn active_capacity(&self) -> usize {
        if self.active_capacity == 0 {
            DEFAULT_ACTIVE_CAPACITY
        } else {
            self.active_capacity
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ManagerConfig {
    /// Membership changes a swarm absorbs before republishing its size.
    #[builder(default = 20)]
    pub change_trigger_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct NegotiatorConfig {
    #[builder(default = 5)]
    pub roundtrip_limit: usize,
    #[builder(default = 1 << 20)]
    pub max_message_len: u64,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct TransmuterConfig {
    #[builder(default = 60_000)]
    pub poll_period_ms: u64,
    /// Also split and merge whole swarms, not just move endpoints between
    /// them.
    #[builder(default = false)]
    pub structural_rebalancing: bool,
}

impl TransmuterConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }
}

impl Default for TransmuterConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct RequestConfig {
    #[builder(default = 30)]
    pub queue_capacity: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(default)]
pub struct ListenerConfig {
    #[builder(default = String::from("0.0.0.0:10000"))]
    pub address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
