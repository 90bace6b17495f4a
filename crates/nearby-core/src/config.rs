use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_PUBLISH_INTERVAL_SECS, DEFAULT_STALE_AFTER_SECS, DEFAULT_TOPIC, SNAP_THRESHOLD_M,
};
use crate::fuzz::PrivacyRadius;

/// User-facing privacy choices. Changes arrive as events at runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacySettings {
    pub radius_m: PrivacyRadius,
    pub ghost_mode: bool,
}

/// What a session does with its channel while ghost mode is on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GhostPolicy {
    /// Withdraw our record but keep watching everyone else.
    #[default]
    Untrack,
    /// Leave the channel entirely until ghost mode is switched off.
    Disconnect,
}

/// Engine tunables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub snap_threshold_m: f64,
    pub publish_interval_secs: u64,
    pub stale_after_secs: u64,
    pub topic: String,
    pub ghost_policy: GhostPolicy,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snap_threshold_m: SNAP_THRESHOLD_M,
            publish_interval_secs: DEFAULT_PUBLISH_INTERVAL_SECS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            topic: DEFAULT_TOPIC.to_string(),
            ghost_policy: GhostPolicy::default(),
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms))
    }
}

/// Everything in `config.toml`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub privacy: PrivacySettings,
    pub engine: EngineConfig,
}
