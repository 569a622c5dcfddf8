//! CAN Telemetry Core Library
//!
//! Acquires frames from a CAN bus (live or replayed), decodes them against DBC
//! signal definitions, persists every frame to a durable store and streams
//! decoded frames to logging sinks, without letting any slow stage stall
//! frame reception.
//!
//! # Architecture
//!
//! ```text
//! FrameSource -> TelemetryEngine loop -> Decoder -> sinks -> FrameStore
//!                        ^                                      |
//!           start/stop/join                       query_recent/query_range
//! ```
//!
//! - [`source`]: simulated replay and live adapters, all with bounded waits
//! - [`Decoder`]: pure mapping of raw frames to named signal values
//! - [`sinks`]: bounded-queue writers (JSON Lines, candump-style trace)
//! - [`FrameStore`]: SQLite store with gap-free sequence numbers
//! - [`TelemetryEngine`]: lifecycle, acquisition loop, health counters
//!
//! Loading configuration files and presenting results belong to the
//! application layer (can-telemetry-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use can_telemetry_core::{EngineConfig, RawFrame, SignalDatabase, TelemetryEngine};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let db = SignalDatabase::from_dbc_file(Path::new("powertrain.dbc")).unwrap();
//!
//! let config = EngineConfig::new()
//!     .with_sim_messages(vec![
//!         RawFrame::new(0x001, vec![1, 2, 3, 4], 2.0),
//!         RawFrame::new(0x002, vec![5, 6, 7, 8], 4.0),
//!     ])
//!     .with_base_log_path("run1")
//!     .with_trace_logging(true);
//!
//! let mut engine = TelemetryEngine::from_config(&config, Arc::new(db)).unwrap();
//! engine.start().unwrap();
//! engine.join().unwrap();
//!
//! for record in engine.read_recent(2).unwrap() {
//!     println!("#{} 0x{:03X} {}", record.sequence, record.arbitration_id(), record.status());
//! }
//! ```

// Public modules
pub mod config;
pub mod decoder;
pub mod engine;
pub mod signals;
pub mod sinks;
pub mod source;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use config::{
    CanFilter, EngineConfig, InterfaceKind, LoggingConfig, ReplayTiming, SinkToggle,
    SourceConfig, StoreConfig,
};
pub use decoder::Decoder;
pub use engine::{EngineHealth, EngineState, TelemetryEngine};
pub use signals::{DatabaseStats, MessageDefinition, SignalDatabase, SignalDefinition};
pub use sinks::{FrameWriter, SinkHandle, SinkStats};
pub use source::{FrameSource, SimulatedSource, SourcePoll};
pub use store::{FrameStore, QueryFilter};
pub use types::{
    DecodeStatus, DecodedFrame, DecodedSignal, EngineFault, RawFrame, Result, SignalValue,
    SourceError, StoreRecord, TelemetryError, Timestamp,
};

// Internal modules (not exposed in public API)
mod message_decoder;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
