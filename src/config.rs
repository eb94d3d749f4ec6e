// src/config.rs
//
// All the thresholds the engine treats as policy rather than contract:
// hysteresis sample counts, grace window, loitering thresholds, queue
// capacities, retry budgets. Loaded from config.yaml.

use crate::types::{Severity, ZoneKind};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub hysteresis: HysteresisConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default = "default_zones_file")]
    pub zones_file: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            hysteresis: HysteresisConfig::default(),
            aggregator: AggregatorConfig::default(),
            rules: RulesConfig::default(),
            alerting: AlertingConfig::default(),
            store: StoreConfig::default(),
            replay: ReplayConfig::default(),
            zones_file: default_zones_file(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_zones_file() -> String {
    "zones.yaml".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock interval for the grace-window sweep. The sweep evaluates
    /// against each lane's stream watermark, not wall time.
    pub sweep_interval_ms: u64,
    /// Stream-time gap after which a silent track is considered terminated
    /// and its memberships force-closed.
    pub track_timeout_ms: f64,
    pub lane_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            track_timeout_ms: 10_000.0,
            lane_queue_capacity: 256,
        }
    }
}

/// Hysteresis thresholds, per zone kind with a fallback profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HysteresisConfig {
    #[serde(default)]
    pub default: HysteresisProfile,
    #[serde(flatten)]
    pub overrides: HashMap<ZoneKind, HysteresisProfile>,
}

impl HysteresisConfig {
    pub fn profile_for(&self, kind: ZoneKind) -> &HysteresisProfile {
        self.overrides.get(&kind).unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteresisProfile {
    /// Consecutive containment samples required to confirm entry.
    pub entry_samples: u32,
    /// Consecutive non-containment samples required to confirm exit.
    pub exit_samples: u32,
    /// Optional time-based alternative for entry: confirmed once the
    /// candidate run spans this many milliseconds, whichever comes first.
    pub entry_dwell_ms: Option<f64>,
}

impl Default for HysteresisProfile {
    fn default() -> Self {
        Self {
            entry_samples: 2,
            exit_samples: 2,
            entry_dwell_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// One event per (type, zone, track).
    PerTrack,
    /// Tracks of the same object class merge into one event per (type, zone).
    SameClass,
    /// All tracks merge into one event per (type, zone).
    AnyClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// How long an event stays open after its last supporting candidate.
    /// Normally larger than the hysteresis window.
    pub grace_ms: f64,
    pub merge_policy: MergePolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            grace_ms: 5000.0,
            merge_policy: MergePolicy::SameClass,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Zone kinds where helmet compliance is enforced for persons.
    pub ppe_zone_kinds: Vec<ZoneKind>,
    pub loitering: LoiteringConfig,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            ppe_zone_kinds: vec![ZoneKind::Danger],
            loitering: LoiteringConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoiteringConfig {
    /// Sliding window the displacement is measured over.
    pub window_ms: f64,
    /// Bounding-box diagonal of the centroid window below which the object
    /// counts as loitering.
    pub max_displacement_px: f64,
}

impl Default for LoiteringConfig {
    fn default() -> Self {
        Self {
            window_ms: 15_000.0,
            max_displacement_px: 40.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    /// Events opening at (or upgraded to) this severity are dispatched.
    pub min_severity: Severity,
    /// Soft cap on each channel's pending queue. Low/medium requests are
    /// shed beyond it; high/critical are never shed.
    pub channel_queue_capacity: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub channels: Vec<ChannelConfig>,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            min_severity: Severity::High,
            channel_queue_capacity: 64,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            channels: vec![ChannelConfig::Log {
                name: "in_app".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// In-app style channel: alerts surface through the log stream.
    Log { name: String },
    /// HTTP webhook (email/SMS gateways sit behind one of these).
    Webhook {
        name: String,
        url: String,
        #[serde(default = "default_webhook_timeout")]
        timeout_secs: u64,
    },
}

impl ChannelConfig {
    pub fn name(&self) -> &str {
        match self {
            ChannelConfig::Log { name } => name,
            ChannelConfig::Webhook { name, .. } => name,
        }
    }
}

fn default_webhook_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub output_dir: String,
    /// Pending writes kept while the backend is unavailable. Overflow drops
    /// the oldest unacknowledged write with a loud warning.
    pub buffer_capacity: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            output_dir: "events".to_string(),
            buffer_capacity: 1024,
            retry_attempts: 3,
            retry_delay_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub input_dir: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            input_dir: "tracks".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "rigwatch=info".to_string(),
        }
    }
}
