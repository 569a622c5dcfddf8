//! Human-readable trace sink writer
//!
//! Writes one candump-style line per frame followed by the decoded signals:
//!
//! ```text
//! (1700000002.000000) can0 001#01020304  ; VehicleSpeed Speed=1 km/h
//! (1700000004.000000) can0 002#05060708  ; <unknown-id>
//! ```

use super::FrameWriter;
use crate::types::{DecodeStatus, DecodedFrame, Result};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// candump marks error frames with this flag in the identifier
const CAN_ERR_FLAG: u32 = 0x2000_0000;

pub struct TraceFileWriter<W: Write = BufWriter<File>> {
    out: W,
    channel: String,
}

impl TraceFileWriter {
    /// Create (truncate) the file at `path`
    pub fn create(path: &Path, channel: impl Into<String>) -> Result<Self> {
        log::info!("Trace log: {:?}", path);
        Ok(Self::new(BufWriter::new(File::create(path)?), channel))
    }
}

impl<W: Write> TraceFileWriter<W> {
    pub fn new(out: W, channel: impl Into<String>) -> Self {
        Self {
            out,
            channel: channel.into(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Format one trace line (without the trailing newline)
pub fn format_trace_line(frame: &DecodedFrame, channel: &str) -> String {
    let raw = &frame.raw;
    let mut line = format!("({:.6}) {} ", raw.timestamp, channel);

    if raw.is_error_frame {
        let _ = write!(line, "{:08X}#", raw.arbitration_id | CAN_ERR_FLAG);
    } else if raw.is_extended_id {
        let _ = write!(line, "{:08X}#", raw.arbitration_id);
    } else {
        let _ = write!(line, "{:03X}#", raw.arbitration_id);
    }

    if raw.is_remote_frame {
        line.push('R');
    } else {
        for byte in &raw.payload {
            let _ = write!(line, "{:02X}", byte);
        }
    }

    line.push_str("  ;");
    if let Some(name) = &frame.message_name {
        let _ = write!(line, " {}", name);
    }
    if frame.status != DecodeStatus::Success {
        let _ = write!(line, " <{}>", frame.status);
    }
    for signal in &frame.signals {
        let _ = write!(line, " {}={}", signal.name, signal.value);
        if let Some(unit) = &signal.unit {
            let _ = write!(line, " {}", unit);
        }
        if let Some(description) = &signal.value_description {
            let _ = write!(line, " ({})", description);
        }
    }

    line
}

impl<W: Write + Send> FrameWriter for TraceFileWriter<W> {
    fn write_frame(&mut self, frame: &DecodedFrame) -> io::Result<()> {
        writeln!(self.out, "{}", format_trace_line(frame, &self.channel))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
