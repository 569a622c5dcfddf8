//! Engine configuration types
//!
//! Describes how the engine obtains frames, where it persists them, and which
//! logging sinks it feeds. Loading these from disk is the application's job;
//! the library only defines the shape and defaults.

use crate::types::{RawFrame, Result, TelemetryError};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Kind of frame source to construct
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// Replay of a preloaded frame sequence
    #[default]
    Simulated,
    /// Live SocketCAN interface (Linux, `socketcan` feature)
    SocketCan,
}

/// How a simulated source schedules its frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayTiming {
    /// Preserve inter-frame deltas, first frame at stream start
    #[default]
    Relative,
    /// Treat timestamps as wall-clock epoch seconds; past frames go out immediately
    Absolute,
    /// No delays at all
    Immediate,
}

/// Frame source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub interface: InterfaceKind,

    /// Interface name for live adapters (e.g. "can0")
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Bus bit rate, live adapters only
    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,

    /// Upper bound on one blocking receive from a live adapter
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,

    #[serde(default)]
    pub replay_timing: ReplayTiming,

    /// Longest single sleep of a simulated source before it re-checks for stop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Preloaded frames for the simulated interface
    #[serde(default)]
    pub sim_messages: Vec<RawFrame>,

    /// Receive filters; a frame passes when any filter accepts it (empty = all)
    #[serde(default)]
    pub filters: Vec<CanFilter>,
}

fn default_channel() -> String {
    "can0".to_string()
}

fn default_bit_rate() -> u32 {
    500_000
}

fn default_receive_timeout_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            interface: InterfaceKind::default(),
            channel: default_channel(),
            bit_rate: default_bit_rate(),
            receive_timeout_ms: default_receive_timeout_ms(),
            replay_timing: ReplayTiming::default(),
            poll_interval_ms: default_poll_interval_ms(),
            sim_messages: Vec::new(),
            filters: Vec::new(),
        }
    }
}

impl SourceConfig {
    /// Reject values that would turn bounded waits into busy loops
    pub fn validate(&self) -> Result<()> {
        if self.receive_timeout_ms == 0 {
            return Err(TelemetryError::InvalidConfig(
                "receive_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(TelemetryError::InvalidConfig(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Mask of a 29-bit identifier
pub const CAN_EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;

/// Acceptance filter: passes frames whose ID bits under `mask` equal `can_id`'s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFilter {
    pub can_id: u32,
    #[serde(default = "default_filter_mask")]
    pub mask: u32,
    /// Restrict to standard (`false`) or extended (`true`) frames
    #[serde(default)]
    pub extended: Option<bool>,
}

fn default_filter_mask() -> u32 {
    CAN_EXTENDED_ID_MASK
}

impl CanFilter {
    /// Accept exactly one identifier, in either frame format
    pub fn exact(can_id: u32) -> Self {
        Self {
            can_id,
            mask: CAN_EXTENDED_ID_MASK,
            extended: None,
        }
    }

    /// Accept every frame
    pub fn accept_all() -> Self {
        Self {
            can_id: 0,
            mask: 0,
            extended: None,
        }
    }

    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = Some(extended);
        self
    }

    pub fn matches(&self, frame: &RawFrame) -> bool {
        if self.extended.is_some_and(|extended| extended != frame.is_extended_id) {
            return false;
        }
        (frame.arbitration_id ^ self.can_id) & self.mask == 0
    }
}

/// True when `filters` is empty or any of them accepts `frame`
pub fn filters_accept(filters: &[CanFilter], frame: &RawFrame) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(frame))
}

/// Toggle and destination for one logging sink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkToggle {
    #[serde(default)]
    pub enabled: bool,
    /// Explicit destination; derived from the base log path when absent
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Logging sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Base path all default log file names are derived from
    #[serde(default)]
    pub base_log_path: Option<PathBuf>,

    /// JSON Lines export of decoded frames
    #[serde(default)]
    pub structured: SinkToggle,

    /// Human-readable candump-style trace
    #[serde(default)]
    pub trace: SinkToggle,

    /// Frames a sink may queue before `emit` starts blocking
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Longest `emit` may block before the frame is dropped for that sink
    #[serde(default = "default_emit_timeout_ms")]
    pub emit_timeout_ms: u64,

    /// Longest shutdown waits for a sink to drain before detaching it
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_emit_timeout_ms() -> u64 {
    50
}

fn default_close_timeout_ms() -> u64 {
    2000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            base_log_path: None,
            structured: SinkToggle::default(),
            trace: SinkToggle::default(),
            queue_capacity: default_queue_capacity(),
            emit_timeout_ms: default_emit_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
        }
    }
}

impl LoggingConfig {
    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Base path, defaulting to a timestamped name in the working directory
    pub fn base_path(&self) -> PathBuf {
        self.base_log_path.clone().unwrap_or_else(default_base_log_path)
    }

    pub fn structured_path(&self) -> PathBuf {
        self.structured
            .path
            .clone()
            .unwrap_or_else(|| with_suffix(&self.base_path(), "_structured.jsonl"))
    }

    pub fn trace_path(&self) -> PathBuf {
        self.trace
            .path
            .clone()
            .unwrap_or_else(|| with_suffix(&self.base_path(), "_trace.log"))
    }
}

/// Persistence store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file; derived from the base log path when absent
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Keep the store in memory (nothing survives the process)
    #[serde(default)]
    pub in_memory: bool,
}

impl EngineConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: replay `frames` through a simulated source
    pub fn with_sim_messages(mut self, frames: Vec<RawFrame>) -> Self {
        self.source.interface = InterfaceKind::Simulated;
        self.source.sim_messages = frames;
        self
    }

    /// Builder method: set the simulated replay timing
    pub fn with_replay_timing(mut self, timing: ReplayTiming) -> Self {
        self.source.replay_timing = timing;
        self
    }

    /// Builder method: use a live SocketCAN interface
    pub fn with_socketcan(mut self, channel: impl Into<String>, bit_rate: u32) -> Self {
        self.source.interface = InterfaceKind::SocketCan;
        self.source.channel = channel.into();
        self.source.bit_rate = bit_rate;
        self
    }

    /// Builder method: set the base path for derived log file names
    pub fn with_base_log_path(mut self, base: impl Into<PathBuf>) -> Self {
        self.logging.base_log_path = Some(base.into());
        self
    }

    /// Builder method: enable or disable the structured (JSON Lines) sink
    pub fn with_structured_logging(mut self, enabled: bool) -> Self {
        self.logging.structured.enabled = enabled;
        self
    }

    /// Builder method: enable or disable the human-readable trace sink
    pub fn with_trace_logging(mut self, enabled: bool) -> Self {
        self.logging.trace.enabled = enabled;
        self
    }

    /// Builder method: only acquire frames accepted by `filters`
    pub fn with_filters(mut self, filters: impl IntoIterator<Item = CanFilter>) -> Self {
        self.source.filters.extend(filters);
        self
    }

    /// Builder method: keep the store in memory
    pub fn with_in_memory_store(mut self, in_memory: bool) -> Self {
        self.store.in_memory = in_memory;
        self
    }

    /// Store file location
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| with_suffix(&self.logging.base_path(), "_store.db"))
    }
}

/// Timestamped base name, e.g. `2024-05-01 13-45-10_log`
pub fn default_base_log_path() -> PathBuf {
    PathBuf::from(format!("{}_log", Local::now().format("%Y-%m-%d %H-%M-%S")))
}

fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::new()
            .with_sim_messages(vec![RawFrame::new(0x1, vec![1], 0.0)])
            .with_replay_timing(ReplayTiming::Immediate)
            .with_base_log_path("/tmp/run1")
            .with_structured_logging(true)
            .with_trace_logging(true);

        assert_eq!(config.source.interface, InterfaceKind::Simulated);
        assert_eq!(config.source.sim_messages.len(), 1);
        assert_eq!(config.source.replay_timing, ReplayTiming::Immediate);
        assert!(config.logging.structured.enabled);
        assert!(config.logging.trace.enabled);
    }

    #[test]
    fn test_derived_paths() {
        let config = EngineConfig::new().with_base_log_path("/tmp/run1");

        assert_eq!(config.store_path(), PathBuf::from("/tmp/run1_store.db"));
        assert_eq!(
            config.logging.structured_path(),
            PathBuf::from("/tmp/run1_structured.jsonl")
        );
        assert_eq!(config.logging.trace_path(), PathBuf::from("/tmp/run1_trace.log"));
    }

    #[test]
    fn test_explicit_paths_win() {
        let mut config = EngineConfig::new().with_base_log_path("/tmp/run1");
        config.logging.trace.path = Some(PathBuf::from("/var/log/bus.log"));
        config.store.path = Some(PathBuf::from("/var/db/frames.db"));

        assert_eq!(config.logging.trace_path(), PathBuf::from("/var/log/bus.log"));
        assert_eq!(config.store_path(), PathBuf::from("/var/db/frames.db"));
    }

    #[test]
    fn test_defaults_from_empty_json() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.source.interface, InterfaceKind::Simulated);
        assert_eq!(config.source.bit_rate, 500_000);
        assert_eq!(config.source.receive_timeout(), Duration::from_secs(1));
        assert_eq!(config.logging.queue_capacity, 256);
        assert_eq!(config.logging.emit_timeout(), Duration::from_millis(50));
        assert_eq!(config.logging.close_timeout(), Duration::from_secs(2));
        assert!(!config.logging.structured.enabled);
        assert!(!config.store.in_memory);
    }

    #[test]
    fn test_filter_matching() {
        let standard = RawFrame::new(0x123, vec![], 0.0);
        let mut extended = RawFrame::new(0x123, vec![], 0.0);
        extended.is_extended_id = true;

        let exact = CanFilter::exact(0x123);
        assert!(exact.matches(&standard));
        assert!(exact.matches(&extended));
        assert!(!exact.matches(&RawFrame::new(0x124, vec![], 0.0)));

        assert!(!exact.with_extended(true).matches(&standard));
        assert!(exact.with_extended(true).matches(&extended));

        // 0x120..=0x12F
        let range = CanFilter {
            can_id: 0x120,
            mask: 0x7F0,
            extended: None,
        };
        assert!(range.matches(&RawFrame::new(0x12F, vec![], 0.0)));
        assert!(!range.matches(&RawFrame::new(0x130, vec![], 0.0)));

        assert!(CanFilter::accept_all().matches(&extended));
        assert!(filters_accept(&[], &standard));
        assert!(!filters_accept(&[CanFilter::exact(0x200)], &standard));
        assert!(filters_accept(&[CanFilter::exact(0x200), exact], &standard));
    }

    #[test]
    fn test_filter_mask_defaults_to_exact() {
        let config: SourceConfig =
            serde_json::from_str(r#"{"filters": [{"can_id": 291}, {"can_id": 512, "mask": 1792, "extended": false}]}"#)
                .unwrap();

        assert_eq!(config.filters[0], CanFilter::exact(0x123));
        assert_eq!(config.filters[1].mask, 0x700);
        assert_eq!(config.filters[1].extended, Some(false));
    }

    #[test]
    fn test_zero_timeouts_are_rejected() {
        assert!(SourceConfig::default().validate().is_ok());

        let config = SourceConfig {
            receive_timeout_ms: 0,
            ..SourceConfig::default()
        };
        assert!(matches!(config.validate(), Err(TelemetryError::InvalidConfig(_))));

        let config = SourceConfig {
            poll_interval_ms: 0,
            ..SourceConfig::default()
        };
        assert!(matches!(config.validate(), Err(TelemetryError::InvalidConfig(_))));
    }

    #[test]
    fn test_default_base_path_is_timestamped() {
        let base = default_base_log_path();
        let name = base.to_string_lossy();
        assert!(name.ends_with("_log"));
        assert_eq!(name.len(), "2024-05-01 13-45-10_log".len());
    }
}
