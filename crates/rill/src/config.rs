use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Per-builder consumption descriptor. Immutable for the builder's lifetime
/// once `Builder::new` has taken it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuilderConfig {
    /// Queues this builder serves. Iteration order follows insertion order
    /// on multi-queue reads; it carries no correctness meaning.
    pub queues: Vec<String>,
    /// Consumer-group name shared by all processes of one builder type.
    pub group: String,
    /// 0 = unbounded; > 0 = reject publish when current length >= cap.
    pub queue_size: u64,
    /// Max entries fetched per group-read call, per queue.
    pub prefetch_count: usize,
    /// Whether this builder's queues carry delayed semantics.
    pub delayed: bool,
    /// Pending-entry idle timeout in ms; 0 disables the reclaim timer.
    pub pending_timeout: u64,
    /// Whether the consume loop removes entries from the log after ack.
    /// `false` leaves them for the trim janitor.
    pub delete_on_ack: bool,
    /// Dead-letter after this many failed attempts; 0 disables dead-lettering.
    pub error_max_count: u32,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            group: String::new(),
            queue_size: 0,
            prefetch_count: 1,
            delayed: false,
            pending_timeout: 0,
            delete_on_ack: true,
            error_max_count: 0,
        }
    }
}

impl BuilderConfig {
    pub fn new(group: impl Into<String>, queues: Vec<String>) -> Self {
        Self {
            group: group.into(),
            queues,
            ..Default::default()
        }
    }
}

/// How the poll loop is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PollMode {
    /// Fixed-period timer.
    #[default]
    Fixed,
    /// Fixed timer whose period grows during sustained idleness, see
    /// [`crate::backoff::AdaptiveInterval`].
    Adaptive,
    /// Tight loop with a short random cooperative yield between iterations,
    /// for long-polling reads on a busy runtime.
    Tight,
}

/// Top-level engine configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub poll: PollConfig,
    pub adaptive: AdaptiveConfig,
    pub fallback: FallbackConfig,
    pub ack: AckConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file. Absent keys take their
    /// defaults, so a partial file is fine.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

/// Poll loop configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollConfig {
    pub mode: PollMode,
    /// Poll interval in ms; also the group-read block timeout.
    pub interval_ms: u64,
    /// Cooperative yield range for [`PollMode::Tight`], inclusive, in ms.
    pub yield_min_ms: u64,
    pub yield_max_ms: u64,
    /// Acknowledged-entry trim timer period in ms; 0 disables the trimmer.
    pub trim_interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            mode: PollMode::Fixed,
            interval_ms: 1,
            yield_min_ms: 5,
            yield_max_ms: 10,
            trim_interval_ms: 0,
        }
    }
}

/// Adaptive interval controller configuration. The controller is enabled
/// only when `backoff_multiplier > 0`, `idle_threshold_ms > 0` and
/// `max_interval_ms` exceeds the initial poll interval.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub idle_threshold_ms: u64,
    pub backoff_multiplier: u32,
    pub max_interval_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            idle_threshold_ms: 0,
            backoff_multiplier: 0,
            max_interval_ms: 0,
        }
    }
}

/// Local fallback store configuration. `path = None` disables the entire
/// fallback subsystem: publish/requeue/reclaim then propagate transport
/// errors directly.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct FallbackConfig {
    pub path: Option<PathBuf>,
    /// Replay timer period in ms; 0 disables the replay loop.
    pub replay_interval_ms: u64,
    /// Records re-attempted per replay cycle.
    pub replay_batch: usize,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            path: None,
            replay_interval_ms: 0,
            replay_batch: 500,
        }
    }
}

/// Acknowledgment retry policy. An un-acked entry risks duplicate delivery
/// once its pending timeout elapses, so ack failures block and retry with
/// doubling backoff rather than being swallowed.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AckConfig {
    pub blocking: bool,
    pub retry_start_ms: u64,
    pub retry_cap_ms: u64,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            blocking: true,
            retry_start_ms: 250,
            retry_cap_ms: 300_000,
        }
    }
}
