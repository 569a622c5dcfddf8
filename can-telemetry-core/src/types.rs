//! Core types for the CAN telemetry engine
//!
//! This module defines the frames that flow through the acquisition pipeline,
//! the persisted record form, and the error taxonomy shared by every stage.
//! Frames are immutable once produced; decoded frames are never mutated after
//! the decoder creates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamp type used for human-facing output
pub type Timestamp = DateTime<Utc>;

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Maximum payload length of a classic CAN frame
pub const CLASSIC_CAN_MAX_DLC: usize = 8;

/// Raw CAN frame as delivered by a frame source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Arbitration ID (11-bit or 29-bit)
    pub arbitration_id: u32,
    /// Frame data bytes (0-8 bytes for classic CAN)
    #[serde(alias = "data", default)]
    pub payload: Vec<u8>,
    /// Capture time in seconds (wall-clock epoch or monotonic)
    pub timestamp: f64,
    /// True if this is an extended (29-bit) ID
    #[serde(default)]
    pub is_extended_id: bool,
    /// True if this is a remote frame
    #[serde(default)]
    pub is_remote_frame: bool,
    /// True if this is an error frame
    #[serde(default)]
    pub is_error_frame: bool,
}

impl RawFrame {
    /// Create a standard data frame
    pub fn new(arbitration_id: u32, payload: impl Into<Vec<u8>>, timestamp: f64) -> Self {
        Self {
            arbitration_id,
            payload: payload.into(),
            timestamp,
            is_extended_id: arbitration_id > 0x7FF,
            is_remote_frame: false,
            is_error_frame: false,
        }
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> usize {
        self.payload.len()
    }

    /// True if the payload fits a classic CAN frame
    pub fn is_classic(&self) -> bool {
        self.payload.len() <= CLASSIC_CAN_MAX_DLC
    }

    /// Convert the timestamp (seconds since epoch) to DateTime<Utc>
    pub fn datetime(&self) -> Timestamp {
        let secs = self.timestamp.floor();
        let nsecs = ((self.timestamp - secs) * 1_000_000_000.0) as u32;
        DateTime::from_timestamp(secs as i64, nsecs).unwrap_or_else(Utc::now)
    }
}

/// Outcome of decoding one raw frame against the signal database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecodeStatus {
    /// Every active signal was extracted
    Success,
    /// Arbitration ID not present in the database
    UnknownId,
    /// Payload too short for at least one defined signal
    Malformed,
}

impl DecodeStatus {
    /// Stable string form, also used as the persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeStatus::Success => "success",
            DecodeStatus::UnknownId => "unknown-id",
            DecodeStatus::Malformed => "malformed",
        }
    }
}

impl fmt::Display for DecodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecodeStatus {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(DecodeStatus::Success),
            "unknown-id" => Ok(DecodeStatus::UnknownId),
            "malformed" => Ok(DecodeStatus::Malformed),
            other => Err(TelemetryError::InvalidData(format!(
                "Unknown decode status: {}",
                other
            ))),
        }
    }
}

/// A decoded signal with its physical value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSignal {
    /// Signal name from the DBC
    pub name: String,
    /// Decoded physical value
    pub value: SignalValue,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Value description from the value table (enumerated signals)
    pub value_description: Option<String>,
    /// Raw value before scaling
    pub raw_value: i64,
}

/// Signal value types produced by the decoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SignalValue {
    /// Signed integer value
    Integer(i64),
    /// Floating-point value (after scaling/offset)
    Float(f64),
    /// Single-bit flag
    Boolean(bool),
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Integer(v) => write!(f, "{}", v),
            SignalValue::Float(v) => write!(f, "{:.3}", v),
            SignalValue::Boolean(v) => write!(f, "{}", if *v { "true" } else { "false" }),
        }
    }
}

impl SignalValue {
    /// Convert signal value to f64
    pub fn as_f64(&self) -> f64 {
        match self {
            SignalValue::Integer(v) => *v as f64,
            SignalValue::Float(v) => *v,
            SignalValue::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Convert signal value to i64 if possible
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SignalValue::Integer(v) => Some(*v),
            SignalValue::Float(v) => Some(*v as i64),
            SignalValue::Boolean(v) => Some(if *v { 1 } else { 0 }),
        }
    }
}

/// A raw frame together with its decoded signals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedFrame {
    /// The frame exactly as received
    pub raw: RawFrame,
    /// Decoded signals, in signal database definition order
    pub signals: Vec<DecodedSignal>,
    /// Decode outcome
    pub status: DecodeStatus,
    /// Message name from the DBC (if the ID is known)
    pub message_name: Option<String>,
}

impl DecodedFrame {
    /// Look up a decoded signal by name
    pub fn signal(&self, name: &str) -> Option<&DecodedSignal> {
        self.signals.iter().find(|s| s.name == name)
    }
}

/// Persisted form of a decoded frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Sequence number assigned at insertion (starts at 1, gap-free)
    pub sequence: u64,
    /// The decoded frame
    pub frame: DecodedFrame,
}

impl StoreRecord {
    pub fn arbitration_id(&self) -> u32 {
        self.frame.raw.arbitration_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.frame.raw.payload
    }

    pub fn timestamp(&self) -> f64 {
        self.frame.raw.timestamp
    }

    pub fn signals(&self) -> &[DecodedSignal] {
        &self.frame.signals
    }

    pub fn status(&self) -> DecodeStatus {
        self.frame.status
    }
}

/// Faults reported by a frame source
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// Adapter-level I/O failure; the frame is skipped and counted
    #[error("Recoverable source fault: {0}")]
    Recoverable(String),

    /// Connection to the bus is gone; the source cannot continue
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl SourceError {
    /// True if the fault ends the source
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::ConnectionLost(_))
    }
}

/// Fatal faults that stop the acquisition loop
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineFault {
    #[error("Fatal source fault: {0}")]
    Source(String),

    #[error("Store fault: {0}")]
    Store(String),
}

/// Errors that can occur in the telemetry engine
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to parse DBC file: {0}")]
    DbcParseError(String),

    #[error("Invalid signal definition: {0}")]
    InvalidSignalDefinition(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Store error: {0}")]
    StoreError(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Frame source is unavailable")]
    SourceUnavailable,

    #[error("Acquisition thread panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Fault(#[from] EngineFault),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
