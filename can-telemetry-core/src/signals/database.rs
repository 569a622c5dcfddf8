//! Signal database
//!
//! Combines message definitions from one or more DBC files into a single
//! read-only lookup table keyed by arbitration ID. The engine borrows it for
//! its whole lifetime; nothing in the acquisition path mutates it.

use crate::types::Result;
use std::collections::HashMap;
use std::path::Path;

/// Highest 11-bit identifier
const MAX_STANDARD_ID: u32 = 0x7FF;

/// Set on lookup keys of extended messages so 0x123 and extended 0x123 never collide
const EXTENDED_KEY_FLAG: u32 = 0x8000_0000;

fn lookup_key(can_id: u32, is_extended: bool) -> u32 {
    if is_extended {
        can_id | EXTENDED_KEY_FLAG
    } else {
        can_id
    }
}

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// Arbitration ID (without any format flag)
    pub id: u32,
    /// True for a 29-bit extended identifier
    pub is_extended: bool,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// Signals in definition order
    pub signals: Vec<SignalDefinition>,
    /// True if this message has multiplexed signals
    pub is_multiplexed: bool,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
    /// Source file (DBC filename)
    pub source: String,
}

impl MessageDefinition {
    /// Create a plain (non-multiplexed) message definition
    pub fn new(id: u32, name: impl Into<String>, size: usize, signals: Vec<SignalDefinition>) -> Self {
        Self {
            id,
            is_extended: id > MAX_STANDARD_ID,
            name: name.into(),
            size,
            sender: None,
            signals,
            is_multiplexed: false,
            multiplexer_signal: None,
            source: String::new(),
        }
    }

    /// Set the identifier format explicitly
    pub fn with_extended(mut self, is_extended: bool) -> Self {
        self.is_extended = is_extended;
        self
    }
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit in the CAN frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Value table for enum-like values (raw_value -> description)
    pub value_table: Option<HashMap<i64, String>>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

impl SignalDefinition {
    /// Unsigned little-endian signal with the given scaling
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16, factor: f64, offset: f64) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor,
            offset,
            min: 0.0,
            max: 0.0,
            unit: None,
            value_table: None,
            multiplexer_info: None,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// The signal database
#[derive(Debug, Default)]
pub struct SignalDatabase {
    /// Key: arbitration ID plus format flag, Value: definitions with that ID (first loaded wins)
    messages: HashMap<u32, Vec<MessageDefinition>>,

    /// Key: Signal name, Value: List of (lookup key, signal index) tuples
    signal_lookup: HashMap<String, Vec<(u32, usize)>>,
}

impl SignalDatabase {
    /// Create a new empty signal database
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a database from a single DBC file
    pub fn from_dbc_file(path: &Path) -> Result<Self> {
        let mut db = Self::new();
        db.add_dbc(path)?;
        Ok(db)
    }

    /// Load a DBC file and add its definitions to the database
    pub fn add_dbc(&mut self, path: &Path) -> Result<()> {
        log::info!("Loading DBC file: {:?}", path);

        let messages = crate::signals::dbc::parse_dbc_file(path)?;
        for message in messages {
            self.add_message(message);
        }

        log::info!("DBC file loaded successfully: {:?}", path);
        Ok(())
    }

    /// Add a message definition to the database
    pub fn add_message(&mut self, message: MessageDefinition) {
        let key = lookup_key(message.id, message.is_extended);
        let already_defined = self.messages.contains_key(&key);

        if already_defined {
            log::warn!(
                "Message 0x{:X} ({}) already defined, keeping first definition",
                message.id,
                message.name
            );
        } else {
            for (sig_idx, signal) in message.signals.iter().enumerate() {
                self.signal_lookup
                    .entry(signal.name.clone())
                    .or_default()
                    .push((key, sig_idx));
            }
        }

        self.messages.entry(key).or_default().push(message);
    }

    /// Get the active message definition for an arbitration ID in the given format
    pub fn get_message(&self, can_id: u32, is_extended: bool) -> Option<&MessageDefinition> {
        self.messages
            .get(&lookup_key(can_id, is_extended))
            .and_then(|msgs| msgs.first())
    }

    /// Find all messages containing a specific signal name
    pub fn find_signal(&self, signal_name: &str) -> Vec<(u32, &SignalDefinition)> {
        self.signal_lookup
            .get(signal_name)
            .map(|locations| {
                locations
                    .iter()
                    .filter_map(|(key, sig_idx)| {
                        let msg = self.messages.get(key)?.first()?;
                        msg.signals.get(*sig_idx).map(|sig| (msg.id, sig))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Arbitration IDs of every message whose name contains `fragment`
    ///
    /// Used to build receive filters from message names.
    pub fn message_ids_matching(&self, fragment: &str) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .messages
            .values()
            .filter_map(|msgs| msgs.first())
            .filter(|m| m.name.contains(fragment))
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        let num_messages: usize = self.messages.values().map(|v| v.len()).sum();
        let num_signals: usize = self
            .messages
            .values()
            .flat_map(|msgs| msgs.iter())
            .map(|msg| msg.signals.len())
            .sum();

        DatabaseStats {
            num_messages,
            num_signals,
        }
    }

    /// Get all unique arbitration IDs in the database
    pub fn all_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .messages
            .values()
            .filter_map(|msgs| msgs.first())
            .map(|m| m.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}
