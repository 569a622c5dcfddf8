//! Frame sources
//!
//! A frame source hands the engine one frame at a time. Every call is a
//! bounded wait: when nothing arrives in time the source answers
//! [`SourcePoll::Idle`] so the acquisition loop can notice stop requests.
//!
//! Two variants exist: [`SimulatedSource`] replays a preloaded capture and
//! [`LiveSource`] wraps a hardware [`BusAdapter`].

use crate::config::{InterfaceKind, SourceConfig};
use crate::types::{RawFrame, Result, SourceError};

pub mod live;
pub mod simulated;
#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan_adapter;

pub use live::{BusAdapter, LiveSource};
pub use simulated::SimulatedSource;

/// Result of one `next_frame` call
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    /// A frame was received
    Frame(RawFrame),
    /// The bounded wait elapsed without a frame
    Idle,
    /// The source reported a fault
    Fault(SourceError),
    /// No more frames will ever be produced
    EndOfStream,
}

/// Common trait for all frame sources
pub trait FrameSource: Send {
    /// Wait (bounded) for the next frame
    fn next_frame(&mut self) -> SourcePoll;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Build the frame source described by `config`
pub fn from_config(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    config.validate()?;
    match config.interface {
        InterfaceKind::Simulated => Ok(Box::new(
            SimulatedSource::new(config.sim_messages.clone())
                .with_timing(config.replay_timing)
                .with_poll_interval(config.poll_interval())
                .with_filters(&config.filters),
        )),
        InterfaceKind::SocketCan => open_socketcan(config),
    }
}

#[cfg(all(target_os = "linux", feature = "socketcan"))]
fn open_socketcan(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let adapter = socketcan_adapter::SocketCanAdapter::open(&config.channel)?;
    log::info!(
        "Opened SocketCAN interface {} (bit rate {} is managed by the OS)",
        config.channel,
        config.bit_rate
    );
    let source = LiveSource::new(adapter, config.receive_timeout())
        .with_filters(&config.filters)
        .map_err(|e| crate::types::TelemetryError::InvalidConfig(e.to_string()))?;
    Ok(Box::new(source))
}

#[cfg(not(all(target_os = "linux", feature = "socketcan")))]
fn open_socketcan(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    Err(crate::types::TelemetryError::InvalidConfig(format!(
        "interface {} requires the `socketcan` feature on Linux",
        config.channel
    )))
}
