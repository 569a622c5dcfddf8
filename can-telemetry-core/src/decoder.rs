//! Frame decoder
//!
//! Maps a raw frame to a [`DecodedFrame`] using the signal database. Decoding
//! is pure: it never blocks, never retries and never fails. Unknown IDs and
//! short payloads are reported through [`DecodeStatus`] instead of errors,
//! since both are expected on a shared bus.

use crate::message_decoder::MessageDecoder;
use crate::signals::SignalDatabase;
use crate::types::{DecodeStatus, DecodedFrame, RawFrame};
use std::sync::Arc;

/// Decoder bound to a shared, read-only signal database
#[derive(Debug, Clone)]
pub struct Decoder {
    signal_db: Arc<SignalDatabase>,
}

impl Decoder {
    /// Create a decoder borrowing the caller's signal database
    pub fn new(signal_db: Arc<SignalDatabase>) -> Self {
        Self { signal_db }
    }

    /// The database this decoder looks frames up in
    pub fn database(&self) -> &SignalDatabase {
        &self.signal_db
    }

    /// Decode a frame against the bound database
    pub fn decode_frame(&self, frame: RawFrame) -> DecodedFrame {
        Self::decode(frame, &self.signal_db)
    }

    /// Decode a frame against `db`
    ///
    /// # Example
    /// ```
    /// use can_telemetry_core::{Decoder, DecodeStatus, RawFrame, SignalDatabase};
    ///
    /// let db = SignalDatabase::new();
    /// let decoded = Decoder::decode(RawFrame::new(0x7FF, vec![0xAA], 0.0), &db);
    /// assert_eq!(decoded.status, DecodeStatus::UnknownId);
    /// assert!(decoded.signals.is_empty());
    /// ```
    pub fn decode(frame: RawFrame, db: &SignalDatabase) -> DecodedFrame {
        let Some(message_def) = db.get_message(frame.arbitration_id, frame.is_extended_id) else {
            log::trace!("Unknown arbitration ID: 0x{:X}", frame.arbitration_id);
            return DecodedFrame {
                raw: frame,
                signals: Vec::new(),
                status: DecodeStatus::UnknownId,
                message_name: None,
            };
        };

        log::trace!(
            "Decoding message: {} (ID 0x{:X})",
            message_def.name,
            frame.arbitration_id
        );

        let extraction = MessageDecoder::decode_signals(&frame.payload, message_def);
        let status = if extraction.truncated {
            log::debug!(
                "Malformed frame 0x{:X}: {} bytes is too short for {}",
                frame.arbitration_id,
                frame.payload.len(),
                message_def.name
            );
            DecodeStatus::Malformed
        } else {
            DecodeStatus::Success
        };

        DecodedFrame {
            raw: frame,
            signals: extraction.signals,
            status,
            message_name: Some(message_def.name.clone()),
        }
    }
}
