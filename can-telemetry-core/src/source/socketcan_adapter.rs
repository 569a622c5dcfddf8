//! SocketCAN adapter (Linux)
//!
//! Bit rate is a property of the kernel interface (`ip link set can0 type can
//! bitrate ...`); the adapter only opens and reads the socket.

use super::live::BusAdapter;
use crate::config::CanFilter;
use crate::types::{RawFrame, Result, SourceError, TelemetryError};
use socketcan::{
    CanFilter as SocketCanFilter, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions,
};
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Linux errno values that mean the interface went away
const ENXIO: i32 = 6;
const ENODEV: i32 = 19;
const ENETDOWN: i32 = 100;

/// Frame-format bit of a kernel `can_id`/`can_mask`
const CAN_EFF_FLAG: u32 = 0x8000_0000;

/// Raw CAN socket bound to one interface
pub struct SocketCanAdapter {
    socket: CanSocket,
    interface: String,
}

impl SocketCanAdapter {
    /// Open and bind a raw CAN socket on `interface` (e.g. "can0")
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface).map_err(|e| {
            TelemetryError::InvalidConfig(format!("Failed to open {}: {}", interface, e))
        })?;
        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }
}

/// Kernel filter for `filter`; the format bit is only compared when requested
fn kernel_filter(filter: &CanFilter) -> SocketCanFilter {
    match filter.extended {
        Some(true) => SocketCanFilter::new(filter.can_id | CAN_EFF_FLAG, filter.mask | CAN_EFF_FLAG),
        Some(false) => SocketCanFilter::new(filter.can_id, filter.mask | CAN_EFF_FLAG),
        None => SocketCanFilter::new(filter.can_id, filter.mask),
    }
}

impl BusAdapter for SocketCanAdapter {
    fn receive(&mut self, timeout: Duration) -> std::result::Result<Option<RawFrame>, SourceError> {
        self.socket
            .set_read_timeout(timeout)
            .map_err(|e| SourceError::Recoverable(format!("set timeout: {}", e)))?;

        match self.socket.read_frame() {
            Ok(frame) => {
                let timestamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                Ok(Some(RawFrame {
                    arbitration_id: frame.raw_id(),
                    payload: frame.data().to_vec(),
                    timestamp,
                    is_extended_id: frame.is_extended(),
                    is_remote_frame: frame.is_remote_frame(),
                    is_error_frame: frame.is_error_frame(),
                }))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) if matches!(e.raw_os_error(), Some(ENXIO | ENODEV | ENETDOWN)) => {
                Err(SourceError::ConnectionLost(format!("{}: {}", self.interface, e)))
            }
            Err(e) => Err(SourceError::Recoverable(format!("{}: {}", self.interface, e))),
        }
    }

    fn set_filters(&mut self, filters: &[CanFilter]) -> std::result::Result<(), SourceError> {
        if filters.is_empty() {
            return Ok(());
        }
        let kernel: Vec<SocketCanFilter> = filters.iter().map(kernel_filter).collect();
        self.socket
            .set_filters(&kernel)
            .map_err(|e| SourceError::Recoverable(format!("{}: failed to set filters: {}", self.interface, e)))?;
        log::info!("Installed {} receive filters on {}", kernel.len(), self.interface);
        Ok(())
    }

    fn name(&self) -> String {
        format!("socketcan:{}", self.interface)
    }
}
