//! DBC file parser
//!
//! Parses Vector DBC files with the `can-dbc` crate and converts them into the
//! internal signal database format.

use crate::signals::database::{
    ByteOrder, MessageDefinition, MultiplexerInfo, SignalDefinition, ValueType,
};
use crate::types::{Result, TelemetryError};
use std::collections::HashMap;
use std::path::Path;

/// DBC marks 29-bit identifiers by setting the top bit of the message ID
const DBC_EXTENDED_ID_FLAG: u32 = 0x8000_0000;

const MAX_STANDARD_ID: u32 = 0x7FF;

/// Parse a DBC file and return message definitions
pub fn parse_dbc_file(path: &Path) -> Result<Vec<MessageDefinition>> {
    log::info!("Parsing DBC file: {:?}", path);

    let bytes = std::fs::read(path).map_err(|e| {
        TelemetryError::DbcParseError(format!("Failed to read file {:?}: {}", path, e))
    })?;

    // Try UTF-8 first, then fall back to Latin-1 (compatible with Windows-1252)
    let dbc_content = match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(err) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            err.into_bytes().iter().map(|&b| b as char).collect()
        }
    };

    let dbc = can_dbc::DBC::from_slice(dbc_content.as_bytes()).map_err(|e| {
        TelemetryError::DbcParseError(format!("Failed to parse DBC file {:?}: {:?}", path, e))
    })?;

    let source_filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.dbc")
        .to_string();

    let mut messages = Vec::new();
    for dbc_msg in dbc.messages() {
        messages.push(convert_message(&dbc, dbc_msg, &source_filename)?);
    }

    log::info!("Parsed {} messages from {:?}", messages.len(), path);

    Ok(messages)
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
    source: &str,
) -> Result<MessageDefinition> {
    let mut is_multiplexed = false;
    let mut multiplexer_signal_name: Option<String> = None;

    // First pass: identify multiplexer signal
    for dbc_sig in dbc_msg.signals() {
        match dbc_sig.multiplexer_indicator() {
            can_dbc::MultiplexIndicator::Multiplexor => {
                is_multiplexed = true;
                multiplexer_signal_name = Some(dbc_sig.name().to_string());
                break;
            }
            can_dbc::MultiplexIndicator::MultiplexedSignal(_) => is_multiplexed = true,
            _ => {}
        }
    }

    let raw_id = dbc_msg.message_id().0;
    let mut signals = Vec::new();
    for dbc_sig in dbc_msg.signals() {
        let value_table = dbc
            .value_descriptions_for_signal(can_dbc::MessageId(raw_id), dbc_sig.name())
            .map(convert_value_table);
        signals.push(convert_signal(
            dbc_sig,
            multiplexer_signal_name.as_deref(),
            value_table,
        )?);
    }

    Ok(MessageDefinition {
        id: raw_id & !DBC_EXTENDED_ID_FLAG,
        is_extended: raw_id & DBC_EXTENDED_ID_FLAG != 0 || raw_id > MAX_STANDARD_ID,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        is_multiplexed,
        multiplexer_signal: multiplexer_signal_name,
        source: source.to_string(),
    })
}

/// Convert `VAL_` entries into a raw value -> description table
fn convert_value_table(descriptions: &[can_dbc::ValDescription]) -> HashMap<i64, String> {
    descriptions
        .iter()
        .map(|d| (*d.a() as i64, d.b().to_string()))
        .collect()
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    dbc_sig: &can_dbc::Signal,
    multiplexer_signal_name: Option<&str>,
    value_table: Option<HashMap<i64, String>>,
) -> Result<SignalDefinition> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value) => Some(MultiplexerInfo {
            multiplexer_signal: multiplexer_signal_name
                .ok_or_else(|| {
                    TelemetryError::InvalidSignalDefinition(format!(
                        "Multiplexed signal '{}' but no multiplexer found",
                        dbc_sig.name()
                    ))
                })?
                .to_string(),
            multiplexer_values: vec![switch_value],
        }),
        _ => None,
    };

    Ok(SignalDefinition {
        name: dbc_sig.name().to_string(),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(dbc_sig.unit().to_string())
        },
        value_table: value_table.filter(|t| !t.is_empty()),
        multiplexer_info,
    })
}
