//! Persistence store
//!
//! Append-only SQLite log of decoded frames. Every append is written through
//! (autocommit, `synchronous = FULL` for file-backed stores) before it returns,
//! so a query issued after `append` returns always observes the record.
//!
//! One connection sits behind a mutex: appends are serialized, and a query
//! runs as a single statement under the same lock, so readers see either all
//! of a record or none of it.

use crate::types::{DecodeStatus, DecodedFrame, DecodedSignal, RawFrame, Result, StoreRecord};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Default busy timeout for file-backed stores
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS frames (
    seq            INTEGER PRIMARY KEY,
    ts             REAL    NOT NULL,
    arbitration_id INTEGER NOT NULL,
    extended       INTEGER NOT NULL,
    remote         INTEGER NOT NULL,
    error          INTEGER NOT NULL,
    dlc            INTEGER NOT NULL,
    data           BLOB    NOT NULL,
    status         TEXT    NOT NULL,
    message_name   TEXT,
    signals        TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS frames_ts ON frames (ts);
";

const SELECT_RECORD: &str = "SELECT seq, ts, arbitration_id, extended, remote, error, data, \
                             status, message_name, signals FROM frames";

struct StoreInner {
    connection: Connection,
    next_sequence: u64,
}

/// Durable, append-only frame store
pub struct FrameStore {
    inner: Mutex<StoreInner>,
    location: String,
}

/// Filtered "most recent" query
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Maximum number of records
    pub limit: usize,
    /// Only these arbitration IDs (empty = all)
    pub include_ids: Vec<u32>,
    /// Never these arbitration IDs
    pub exclude_ids: Vec<u32>,
    /// Only error frames (`Some(true)`) or only non-error frames (`Some(false)`)
    pub error_frames: Option<bool>,
}

impl QueryFilter {
    pub fn recent(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn include(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.include_ids.extend(ids);
        self
    }

    pub fn exclude(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.exclude_ids.extend(ids);
        self
    }

    pub fn error_frames(mut self, error_frames: bool) -> Self {
        self.error_frames = Some(error_frames);
        self
    }
}

impl FrameStore {
    /// Open (or create) a file-backed store
    ///
    /// Sequence numbering continues after the highest record already present.
    pub fn open(path: &Path) -> Result<Self> {
        log::info!("Opening frame store: {:?}", path);
        let connection = Connection::open(path)?;
        connection.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        connection.execute_batch("PRAGMA synchronous = FULL;")?;
        Self::initialise(connection, path.display().to_string())
    }

    /// Open a store that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        Self::initialise(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn initialise(connection: Connection, location: String) -> Result<Self> {
        connection.execute_batch(SCHEMA)?;
        let last: i64 =
            connection.query_row("SELECT COALESCE(MAX(seq), 0) FROM frames", [], |row| row.get(0))?;
        let next_sequence = last as u64 + 1;

        if last > 0 {
            log::info!("Frame store {} holds {} records", location, last);
        }

        Ok(Self {
            inner: Mutex::new(StoreInner {
                connection,
                next_sequence,
            }),
            location,
        })
    }

    /// Where the store lives (file path or `:memory:`)
    pub fn location(&self) -> &str {
        &self.location
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // A panic cannot leave a half-applied append: the sequence counter only
        // moves after the insert has committed.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist `frame` under the next sequence number
    pub fn append(&self, frame: DecodedFrame) -> Result<StoreRecord> {
        let signals_json = serde_json::to_string(&frame.signals)?;
        let mut inner = self.lock();
        let sequence = inner.next_sequence;

        inner.connection.execute(
            "INSERT INTO frames (seq, ts, arbitration_id, extended, remote, error, dlc, data, \
             status, message_name, signals) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                sequence as i64,
                frame.raw.timestamp,
                frame.raw.arbitration_id as i64,
                frame.raw.is_extended_id,
                frame.raw.is_remote_frame,
                frame.raw.is_error_frame,
                frame.raw.dlc() as i64,
                frame.raw.payload,
                frame.status.as_str(),
                frame.message_name,
                signals_json,
            ],
        )?;
        inner.next_sequence += 1;

        log::trace!("Stored frame 0x{:X} as #{}", frame.raw.arbitration_id, sequence);
        Ok(StoreRecord { sequence, frame })
    }

    /// Number of records in the store
    pub fn len(&self) -> u64 {
        self.lock().next_sequence - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `n` most recent records, oldest first
    pub fn query_recent(&self, n: usize) -> Result<Vec<StoreRecord>> {
        self.query_filtered(&QueryFilter::recent(n))
    }

    /// Records whose timestamp lies in `[start, end]`, in sequence order
    pub fn query_range(&self, start: f64, end: f64) -> Result<Vec<StoreRecord>> {
        let inner = self.lock();
        let mut stmt = inner
            .connection
            .prepare_cached(&format!("{} WHERE ts >= ?1 AND ts <= ?2 ORDER BY seq ASC", SELECT_RECORD))?;
        let records = stmt
            .query_map(params![start, end], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// The most recent records matching `filter`, oldest first
    pub fn query_filtered(&self, filter: &QueryFilter) -> Result<Vec<StoreRecord>> {
        if filter.limit == 0 {
            return Ok(Vec::new());
        }

        let mut conditions = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if !filter.include_ids.is_empty() {
            conditions.push(format!(
                "arbitration_id IN ({})",
                placeholders(filter.include_ids.len())
            ));
            values.extend(filter.include_ids.iter().map(|id| Value::Integer(*id as i64)));
        }
        if !filter.exclude_ids.is_empty() {
            conditions.push(format!(
                "arbitration_id NOT IN ({})",
                placeholders(filter.exclude_ids.len())
            ));
            values.extend(filter.exclude_ids.iter().map(|id| Value::Integer(*id as i64)));
        }
        if let Some(error_frames) = filter.error_frames {
            conditions.push("error = ?".to_string());
            values.push(Value::Integer(error_frames as i64));
        }

        let mut query = SELECT_RECORD.to_string();
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }
        query.push_str(" ORDER BY seq DESC LIMIT ?");
        values.push(Value::Integer(i64::try_from(filter.limit).unwrap_or(i64::MAX)));

        let inner = self.lock();
        let mut stmt = inner.connection.prepare(&query)?;
        let mut records = stmt
            .query_map(params_from_iter(values.iter()), row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<StoreRecord> {
    let sequence: i64 = row.get(0)?;
    let status_text: String = row.get(7)?;
    let status = status_text
        .parse::<DecodeStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;
    let signals_text: String = row.get(9)?;
    let signals: Vec<DecodedSignal> = serde_json::from_str(&signals_text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(9, Type::Text, Box::new(e)))?;
    let arbitration_id: i64 = row.get(2)?;

    Ok(StoreRecord {
        sequence: sequence as u64,
        frame: DecodedFrame {
            raw: RawFrame {
                arbitration_id: arbitration_id as u32,
                payload: row.get(6)?,
                timestamp: row.get(1)?,
                is_extended_id: row.get(3)?,
                is_remote_frame: row.get(4)?,
                is_error_frame: row.get(5)?,
            },
            signals,
            status,
            message_name: row.get(8)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalValue;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn frame(id: u32, ts: f64) -> DecodedFrame {
        DecodedFrame {
            raw: RawFrame::new(id, vec![id as u8, 0xAA], ts),
            signals: vec![DecodedSignal {
                name: "Value".to_string(),
                value: SignalValue::Float(ts * 1.5),
                unit: Some("V".to_string()),
                value_description: None,
                raw_value: id as i64,
            }],
            status: DecodeStatus::Success,
            message_name: Some("Msg".to_string()),
        }
    }

    fn sequences(records: &[StoreRecord]) -> Vec<u64> {
        records.iter().map(|r| r.sequence).collect()
    }

    #[test]
    fn test_append_assigns_gap_free_sequences() {
        let store = FrameStore::open_in_memory().unwrap();
        assert!(store.is_empty());

        for i in 0..5 {
            let record = store.append(frame(0x100 + i, i as f64)).unwrap();
            assert_eq!(record.sequence, i as u64 + 1);
        }
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_record_round_trips_all_fields() {
        let store = FrameStore::open_in_memory().unwrap();
        let mut original = frame(0x18FF_0001, 12.25);
        original.raw.is_extended_id = true;
        original.raw.is_error_frame = true;

        store.append(original.clone()).unwrap();
        let records = store.query_recent(1).unwrap();

        assert_eq!(records[0].frame, original);
        assert_eq!(records[0].arbitration_id(), 0x18FF_0001);
        assert_eq!(records[0].payload(), &[0x01, 0xAA]);
    }

    #[test]
    fn test_query_recent_window() {
        let store = FrameStore::open_in_memory().unwrap();
        for i in 0..3 {
            store.append(frame(i, i as f64)).unwrap();
        }

        // Fewer records than requested
        assert_eq!(sequences(&store.query_recent(10).unwrap()), vec![1, 2, 3]);
        // Most recent n, oldest first
        assert_eq!(sequences(&store.query_recent(2).unwrap()), vec![2, 3]);
        assert!(store.query_recent(0).unwrap().is_empty());
    }

    #[test]
    fn test_query_range_is_inclusive() {
        let store = FrameStore::open_in_memory().unwrap();
        for ts in [1.0, 2.0, 3.0, 4.0] {
            store.append(frame(0x10, ts)).unwrap();
        }

        let records = store.query_range(2.0, 3.0).unwrap();
        let stamps: Vec<f64> = records.iter().map(|r| r.timestamp()).collect();
        assert_eq!(stamps, vec![2.0, 3.0]);
        assert!(store.query_range(5.0, 1.0).unwrap().is_empty());
    }

    #[test]
    fn test_query_filtered() {
        let store = FrameStore::open_in_memory().unwrap();
        for (i, id) in [0x1, 0x2, 0x3, 0x1, 0x2].into_iter().enumerate() {
            let mut f = frame(id, i as f64);
            f.raw.is_error_frame = id == 0x3;
            store.append(f).unwrap();
        }

        let only_one = store.query_filtered(&QueryFilter::recent(10).include([0x1])).unwrap();
        assert_eq!(sequences(&only_one), vec![1, 4]);

        let not_two = store.query_filtered(&QueryFilter::recent(2).exclude([0x2])).unwrap();
        assert_eq!(sequences(&not_two), vec![3, 4]);

        let errors = store.query_filtered(&QueryFilter::recent(10).error_frames(true)).unwrap();
        assert_eq!(sequences(&errors), vec![3]);
    }

    #[test]
    fn test_reopen_continues_numbering() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frames.db");

        {
            let store = FrameStore::open(&path).unwrap();
            store.append(frame(0x1, 1.0)).unwrap();
            store.append(frame(0x2, 2.0)).unwrap();
        }

        let store = FrameStore::open(&path).unwrap();
        assert_eq!(store.location(), path.display().to_string());
        assert_eq!(store.len(), 2);
        let record = store.append(frame(0x3, 3.0)).unwrap();
        assert_eq!(record.sequence, 3);
        assert_eq!(sequences(&store.query_recent(5).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_prefix() {
        let store = Arc::new(FrameStore::open_in_memory().unwrap());
        let writer_store = Arc::clone(&store);

        let writer = thread::spawn(move || {
            for i in 0..200u32 {
                writer_store.append(frame(i, i as f64)).unwrap();
            }
        });

        while !writer.is_finished() {
            let records = store.query_recent(1000).unwrap();
            let seqs = sequences(&records);
            let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
            assert_eq!(seqs, expected);
            for record in &records {
                assert_eq!(record.signals().len(), 1);
            }
        }
        writer.join().unwrap();
        assert_eq!(store.len(), 200);
    }
}
