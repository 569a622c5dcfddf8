//! Signal extraction
//!
//! Extracts signal values from raw CAN payloads based on signal definitions
//! from the signal database. Handles bit extraction, endianness, multiplexing,
//! and physical value conversion.

use crate::signals::database::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{DecodedSignal, SignalValue};

/// Signals extracted from one payload
#[derive(Debug, Default)]
pub(crate) struct SignalExtraction {
    /// Decoded signals in definition order
    pub signals: Vec<DecodedSignal>,
    /// True if at least one active signal did not fit the payload
    pub truncated: bool,
}

/// Message decoder - extracts signals from CAN payloads
pub(crate) struct MessageDecoder;

impl MessageDecoder {
    /// Decode every active signal of `message_def` from `payload`
    pub fn decode_signals(payload: &[u8], message_def: &MessageDefinition) -> SignalExtraction {
        let mut extraction = SignalExtraction::default();
        let mut multiplexer_value: Option<u64> = None;

        // For multiplexed messages, first extract the multiplexer signal value
        if let Some(ref mux_signal_name) = message_def.multiplexer_signal {
            if let Some(mux_signal) = message_def
                .signals
                .iter()
                .find(|s| s.name == *mux_signal_name)
            {
                multiplexer_value =
                    Self::extract_signal_value(payload, mux_signal).map(|v| v as u64);
            }
        }

        for signal in &message_def.signals {
            if let Some(ref mux_info) = signal.multiplexer_info {
                match multiplexer_value {
                    Some(current) if mux_info.multiplexer_values.contains(&current) => {}
                    Some(_) => continue,
                    None => {
                        // Multiplexor unreadable, the selected branch is unknown
                        extraction.truncated = true;
                        continue;
                    }
                }
            }

            match Self::decode_signal(payload, signal) {
                Some(decoded) => extraction.signals.push(decoded),
                None => extraction.truncated = true,
            }
        }

        extraction
    }

    /// Decode a single signal from payload data
    fn decode_signal(data: &[u8], signal: &SignalDefinition) -> Option<DecodedSignal> {
        let raw_value = Self::extract_signal_value(data, signal)?;

        let physical_value = signal.offset + signal.factor * (raw_value as f64);

        let value = if signal.factor == 1.0 && signal.offset == 0.0 && signal.length == 1 {
            // Boolean signal (single bit, no scaling)
            SignalValue::Boolean(raw_value != 0)
        } else if signal.factor != 1.0 || signal.offset != 0.0 {
            SignalValue::Float(physical_value)
        } else {
            SignalValue::Integer(raw_value)
        };

        let value_description = signal
            .value_table
            .as_ref()
            .and_then(|table| table.get(&raw_value))
            .cloned();

        Some(DecodedSignal {
            name: signal.name.clone(),
            value,
            unit: signal.unit.clone(),
            value_description,
            raw_value,
        })
    }

    /// Extract raw signal value from payload data
    ///
    /// Returns `None` if the signal extends past the end of the payload.
    fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
        let start_bit = signal.start_bit as usize;
        let length = signal.length as usize;

        if length == 0 || length > 64 {
            log::debug!("Signal '{}' has unsupported length {}", signal.name, length);
            return None;
        }

        let raw_value = match signal.byte_order {
            ByteOrder::LittleEndian => Self::extract_little_endian(data, start_bit, length),
            ByteOrder::BigEndian => Self::extract_big_endian(data, start_bit, length),
        };

        let Some(raw_value) = raw_value else {
            log::debug!(
                "Signal '{}' does not fit a {}-byte payload",
                signal.name,
                data.len()
            );
            return None;
        };

        Some(match signal.value_type {
            ValueType::Unsigned => raw_value as i64,
            ValueType::Signed => Self::sign_extend(raw_value, length),
        })
    }

    /// Extract signal with little-endian (Intel) byte order
    ///
    /// Start bit points to the LSB; bits count upward through the payload.
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        let mut result: u64 = 0;

        for i in 0..length {
            let bit_pos = start_bit + i;
            let byte = *data.get(bit_pos / 8)?;
            let bit_value = (byte >> (bit_pos % 8)) & 0x01;
            result |= (bit_value as u64) << i;
        }

        Some(result)
    }

    /// Extract signal with big-endian (Motorola) byte order
    ///
    /// Start bit points to the MSB in DBC numbering (bit 0 is the LSB of
    /// byte 0). The signal walks down within a byte and continues at the MSB
    /// of the next byte.
    fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> Option<u64> {
        let mut result: u64 = 0;
        let mut bit_pos = start_bit;

        for i in 0..length {
            let byte = *data.get(bit_pos / 8)?;
            let bit_value = (byte >> (bit_pos % 8)) & 0x01;
            result = (result << 1) | bit_value as u64;

            if i + 1 < length {
                if bit_pos % 8 == 0 {
                    bit_pos += 15;
                } else {
                    bit_pos -= 1;
                }
            }
        }

        Some(result)
    }

    /// Sign-extend a value from N bits to 64 bits
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::database::MultiplexerInfo;

    #[test]
    fn test_extract_little_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_little_endian(&data, 0, 8), Some(0xAB));
    }

    #[test]
    fn test_extract_little_endian_cross_byte() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_little_endian(&data, 0, 16), Some(0xCDAB));
        assert_eq!(MessageDecoder::extract_little_endian(&data, 4, 8), Some(0xDA));
    }

    #[test]
    fn test_extract_little_endian_out_of_range() {
        let data = vec![0xAB];
        assert_eq!(MessageDecoder::extract_little_endian(&data, 4, 8), None);
    }

    #[test]
    fn test_extract_big_endian() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(MessageDecoder::extract_big_endian(&data, 7, 8), Some(0xAB));
        assert_eq!(MessageDecoder::extract_big_endian(&data, 7, 16), Some(0xABCD));
        // Low nibble of byte 0
        assert_eq!(MessageDecoder::extract_big_endian(&data, 3, 4), Some(0xB));
        // Crosses from the low nibble of byte 1 into the high nibble of byte 2
        assert_eq!(MessageDecoder::extract_big_endian(&data, 11, 8), Some(0xDE));
        assert_eq!(MessageDecoder::extract_big_endian(&data[..1], 7, 16), None);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(MessageDecoder::sign_extend(0x7F, 8), 127);
        assert_eq!(MessageDecoder::sign_extend(0xFF, 8), -1);
        assert_eq!(MessageDecoder::sign_extend(0x8000, 16), -32768);
    }

    #[test]
    fn test_value_classification() {
        let flag = SignalDefinition::new("Flag", 0, 1, 1.0, 0.0);
        let temp = SignalDefinition::new("Temp", 8, 8, 1.0, -40.0);
        let count = SignalDefinition::new("Count", 16, 8, 1.0, 0.0);
        let message = MessageDefinition::new(0x10, "Mixed", 3, vec![flag, temp, count]);

        let extraction = MessageDecoder::decode_signals(&[0x01, 60, 7], &message);
        assert!(!extraction.truncated);
        assert_eq!(extraction.signals[0].value, SignalValue::Boolean(true));
        assert_eq!(extraction.signals[1].value, SignalValue::Float(20.0));
        assert_eq!(extraction.signals[2].value, SignalValue::Integer(7));
    }

    #[test]
    fn test_signed_scaled_signal() {
        let signal = SignalDefinition::new("Torque", 0, 16, 0.5, 0.0)
            .with_value_type(ValueType::Signed);
        let message = MessageDefinition::new(0x20, "Torque", 2, vec![signal]);

        // 0xFFFE = -2 raw
        let extraction = MessageDecoder::decode_signals(&[0xFE, 0xFF], &message);
        assert_eq!(extraction.signals[0].raw_value, -2);
        assert_eq!(extraction.signals[0].value, SignalValue::Float(-1.0));
    }

    #[test]
    fn test_multiplexed_selection() {
        let mode = SignalDefinition::new("Mode", 0, 8, 1.0, 0.0);
        let mut sig_a = SignalDefinition::new("SignalA", 8, 8, 1.0, 0.0);
        sig_a.multiplexer_info = Some(MultiplexerInfo {
            multiplexer_signal: "Mode".to_string(),
            multiplexer_values: vec![0],
        });
        let mut sig_b = SignalDefinition::new("SignalB", 8, 8, 1.0, 0.0);
        sig_b.multiplexer_info = Some(MultiplexerInfo {
            multiplexer_signal: "Mode".to_string(),
            multiplexer_values: vec![1],
        });
        let mut message = MessageDefinition::new(0x30, "Muxed", 2, vec![mode, sig_a, sig_b]);
        message.is_multiplexed = true;
        message.multiplexer_signal = Some("Mode".to_string());

        let extraction = MessageDecoder::decode_signals(&[1, 42], &message);
        let names: Vec<&str> = extraction.signals.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Mode", "SignalB"]);
        assert_eq!(extraction.signals[1].value, SignalValue::Integer(42));

        let empty = MessageDecoder::decode_signals(&[], &message);
        assert!(empty.truncated);
        assert!(empty.signals.is_empty());
    }

    #[test]
    fn test_partial_payload_keeps_fitting_signals() {
        let first = SignalDefinition::new("First", 0, 8, 1.0, 0.0);
        let second = SignalDefinition::new("Second", 8, 16, 1.0, 0.0);
        let message = MessageDefinition::new(0x40, "Partial", 3, vec![first, second]);

        let extraction = MessageDecoder::decode_signals(&[9, 1], &message);
        assert!(extraction.truncated);
        assert_eq!(extraction.signals.len(), 1);
        assert_eq!(extraction.signals[0].name, "First");
    }
}
