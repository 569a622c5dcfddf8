//! Telemetry engine
//!
//! Owns one frame source and runs the acquisition loop on a dedicated thread:
//! pull a frame, decode it, hand it to every sink, then append it to the
//! store, in that order, before pulling the next one.
//!
//! ```text
//!            start()            stop()              loop exit
//! Stopped ----------> Running ---------> Stopping -----------> Stopped
//!                        |                                        ^
//!                        +------ end of stream / fatal fault -----+
//! ```
//!
//! Decode and sink faults are only counted. A fatal source fault or any store
//! fault ends the loop; it is kept as [`TelemetryEngine::last_error`] and
//! returned by [`TelemetryEngine::join`].

use crate::config::{default_base_log_path, EngineConfig, InterfaceKind};
use crate::decoder::Decoder;
use crate::signals::SignalDatabase;
use crate::sinks::{SinkHandle, SinkStats, StructuredFileWriter, TraceFileWriter};
use crate::source::{self, FrameSource, SourcePoll};
use crate::store::{FrameStore, QueryFilter};
use crate::types::{DecodeStatus, EngineFault, Result, StoreRecord, TelemetryError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Lifecycle state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Stopped,
    Running,
    Stopping,
}

/// Snapshot of the engine's health counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineHealth {
    /// Frames delivered by the source
    pub frames_received: u64,
    /// Frames appended to the store
    pub frames_persisted: u64,
    /// Faults reported by the source (recoverable and fatal)
    pub source_faults: u64,
    /// Frames whose ID is not in the signal database
    pub unknown_ids: u64,
    /// Frames too short for their message definition
    pub malformed_frames: u64,
    /// Frames dropped by sinks, summed over all sinks
    pub sink_overflows: u64,
    /// Failed sink writes, summed over all sinks
    pub sink_write_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_persisted: AtomicU64,
    source_faults: AtomicU64,
    unknown_ids: AtomicU64,
    malformed_frames: AtomicU64,
}

/// State shared between the engine handle and its acquisition thread
struct EngineShared {
    state: Mutex<EngineState>,
    stop_requested: AtomicBool,
    counters: Counters,
    last_error: Mutex<Option<EngineFault>>,
}

impl EngineShared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_error(&self) -> MutexGuard<'_, Option<EngineFault>> {
        self.last_error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_fault(&self, fault: EngineFault) {
        log::error!("Acquisition stopped: {}", fault);
        *self.last_error() = Some(fault);
    }
}

/// Returns the engine to Stopped when the acquisition thread exits, even by panic
struct StoppedOnExit<'a>(&'a EngineShared);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        *self.0.state() = EngineState::Stopped;
    }
}

/// Everything the acquisition thread needs besides the source
struct AcquisitionLoop {
    shared: Arc<EngineShared>,
    decoder: Decoder,
    store: Arc<FrameStore>,
    sinks: Vec<Arc<SinkHandle>>,
}

impl AcquisitionLoop {
    fn run(self, mut source: Box<dyn FrameSource>) -> Box<dyn FrameSource> {
        let shared = Arc::clone(&self.shared);
        let _stopped = StoppedOnExit(&shared);
        let counters = &shared.counters;

        log::info!(
            "Acquisition started: {} -> {} ({} message definitions)",
            source.describe(),
            self.store.location(),
            self.decoder.database().stats().num_messages
        );

        while !shared.stop_requested.load(Ordering::Acquire) {
            match source.next_frame() {
                SourcePoll::Frame(frame) => {
                    counters.frames_received.fetch_add(1, Ordering::Relaxed);

                    let decoded = self.decoder.decode_frame(frame);
                    match decoded.status {
                        DecodeStatus::Success => {}
                        DecodeStatus::UnknownId => {
                            counters.unknown_ids.fetch_add(1, Ordering::Relaxed);
                        }
                        DecodeStatus::Malformed => {
                            counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    for sink in &self.sinks {
                        sink.emit(&decoded);
                    }

                    if let Err(e) = self.store.append(decoded) {
                        shared.record_fault(EngineFault::Store(e.to_string()));
                        break;
                    }
                    counters.frames_persisted.fetch_add(1, Ordering::Relaxed);
                }
                SourcePoll::Idle => {}
                SourcePoll::Fault(err) => {
                    counters.source_faults.fetch_add(1, Ordering::Relaxed);
                    if err.is_fatal() {
                        shared.record_fault(EngineFault::Source(err.to_string()));
                        break;
                    }
                }
                SourcePoll::EndOfStream => {
                    log::info!("Frame source reached end of stream");
                    break;
                }
            }
        }

        *shared.state() = EngineState::Stopping;
        log::info!(
            "Acquisition finished: {} frames received, {} persisted",
            counters.frames_received.load(Ordering::Relaxed),
            counters.frames_persisted.load(Ordering::Relaxed)
        );
        source
    }
}

/// CAN telemetry engine for one bus connection
pub struct TelemetryEngine {
    shared: Arc<EngineShared>,
    source: Option<Box<dyn FrameSource>>,
    decoder: Decoder,
    store: Arc<FrameStore>,
    sinks: Vec<Arc<SinkHandle>>,
    worker: Option<JoinHandle<Box<dyn FrameSource>>>,
}

impl TelemetryEngine {
    /// Create a stopped engine around `source`
    pub fn new(
        source: Box<dyn FrameSource>,
        decoder: Decoder,
        store: impl Into<Arc<FrameStore>>,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(EngineState::Stopped),
                stop_requested: AtomicBool::new(false),
                counters: Counters::default(),
                last_error: Mutex::new(None),
            }),
            source: Some(source),
            decoder,
            store: store.into(),
            sinks: Vec::new(),
            worker: None,
        }
    }

    /// Builder method: add a logging sink
    ///
    /// Sinks added while running take effect on the next `start`.
    pub fn with_sink(mut self, sink: SinkHandle) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Build the source, store and sinks described by `config`
    pub fn from_config(config: &EngineConfig, signal_db: Arc<SignalDatabase>) -> Result<Self> {
        // Resolve the timestamped base once so every derived file shares it
        let mut config = config.clone();
        config
            .logging
            .base_log_path
            .get_or_insert_with(default_base_log_path);

        let source = source::from_config(&config.source)?;
        let store = if config.store.in_memory {
            FrameStore::open_in_memory()?
        } else {
            FrameStore::open(&config.store_path())?
        };
        let mut engine = Self::new(source, Decoder::new(signal_db), store);

        let logging = &config.logging;
        if logging.structured.enabled {
            let writer = StructuredFileWriter::create(&logging.structured_path())?;
            let sink = SinkHandle::spawn(
                "structured",
                writer,
                logging.queue_capacity,
                logging.emit_timeout(),
            )?
            .with_close_timeout(logging.close_timeout());
            engine = engine.with_sink(sink);
        }
        if logging.trace.enabled {
            let channel = match config.source.interface {
                InterfaceKind::Simulated => "sim".to_string(),
                InterfaceKind::SocketCan => config.source.channel.clone(),
            };
            let writer = TraceFileWriter::create(&logging.trace_path(), channel)?;
            let sink =
                SinkHandle::spawn("trace", writer, logging.queue_capacity, logging.emit_timeout())?
                    .with_close_timeout(logging.close_timeout());
            engine = engine.with_sink(sink);
        }

        Ok(engine)
    }

    /// Start the acquisition loop on its own thread
    pub fn start(&mut self) -> Result<()> {
        {
            let state = self.shared.state();
            if *state != EngineState::Stopped {
                return Err(TelemetryError::AlreadyRunning);
            }
        }

        // The previous loop has exited on its own; take the source back
        if self.worker.is_some() {
            self.reclaim_source()?;
        }
        let source = self.source.take().ok_or(TelemetryError::SourceUnavailable)?;

        self.shared.stop_requested.store(false, Ordering::Release);
        *self.shared.last_error() = None;
        *self.shared.state() = EngineState::Running;

        let acquisition = AcquisitionLoop {
            shared: Arc::clone(&self.shared),
            decoder: self.decoder.clone(),
            store: Arc::clone(&self.store),
            sinks: self.sinks.clone(),
        };
        let spawned = thread::Builder::new()
            .name("can-acquisition".to_string())
            .spawn(move || acquisition.run(source));

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                // The source moved into the failed closure and is gone
                *self.shared.state() = EngineState::Stopped;
                Err(e.into())
            }
        }
    }

    /// Ask the acquisition loop to exit after its current iteration
    ///
    /// Safe to call any number of times, in any state.
    pub fn stop(&self) {
        let mut state = self.shared.state();
        if *state == EngineState::Running {
            *state = EngineState::Stopping;
            self.shared.stop_requested.store(true, Ordering::Release);
            log::info!("Stop requested");
        }
    }

    /// Wait for the acquisition thread to exit
    ///
    /// Returns immediately if the engine was never started. Returns the fatal
    /// fault that ended the last run, if any.
    pub fn join(&mut self) -> Result<()> {
        if self.worker.is_some() {
            self.reclaim_source()?;
        }
        match self.last_error() {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    fn reclaim_source(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.join() {
            Ok(source) => {
                self.source = Some(source);
                Ok(())
            }
            Err(_) => {
                log::error!("Acquisition thread panicked");
                Err(TelemetryError::WorkerPanicked)
            }
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// The fatal fault that ended the last run
    pub fn last_error(&self) -> Option<EngineFault> {
        self.shared.last_error().clone()
    }

    pub fn health(&self) -> EngineHealth {
        let counters = &self.shared.counters;
        let mut health = EngineHealth {
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            frames_persisted: counters.frames_persisted.load(Ordering::Relaxed),
            source_faults: counters.source_faults.load(Ordering::Relaxed),
            unknown_ids: counters.unknown_ids.load(Ordering::Relaxed),
            malformed_frames: counters.malformed_frames.load(Ordering::Relaxed),
            ..EngineHealth::default()
        };
        for stats in self.sink_stats() {
            health.sink_overflows += stats.overflows;
            health.sink_write_errors += stats.write_errors;
        }
        health
    }

    pub fn sink_stats(&self) -> Vec<SinkStats> {
        self.sinks.iter().map(|sink| sink.stats()).collect()
    }

    /// The store this engine appends to
    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    /// The `n` most recent records, oldest first
    pub fn query_recent(&self, n: usize) -> Result<Vec<StoreRecord>> {
        self.check_store()?;
        self.store.query_recent(n)
    }

    /// Alias of [`query_recent`](Self::query_recent)
    pub fn read_recent(&self, n: usize) -> Result<Vec<StoreRecord>> {
        self.query_recent(n)
    }

    /// Records with timestamps in `[start, end]`, in sequence order
    pub fn query_range(&self, start: f64, end: f64) -> Result<Vec<StoreRecord>> {
        self.check_store()?;
        self.store.query_range(start, end)
    }

    pub fn query_filtered(&self, filter: &QueryFilter) -> Result<Vec<StoreRecord>> {
        self.check_store()?;
        self.store.query_filtered(filter)
    }

    /// A store fault stays visible to every later query
    fn check_store(&self) -> Result<()> {
        match self.last_error() {
            Some(fault @ EngineFault::Store(_)) => Err(fault.into()),
            _ => Ok(()),
        }
    }
}

impl Drop for TelemetryEngine {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.reclaim_source() {
            log::warn!("Engine dropped with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplayTiming;
    use crate::signals::{MessageDefinition, SignalDefinition};
    use crate::source::SimulatedSource;
    use crate::types::{RawFrame, SourceError};
    use std::time::{Duration, Instant};

    fn speed_database() -> Arc<SignalDatabase> {
        let mut db = SignalDatabase::new();
        db.add_message(MessageDefinition::new(
            0x001,
            "VehicleSpeed",
            4,
            vec![SignalDefinition::new("Speed", 0, 8, 1.0, 0.0).with_unit("km/h")],
        ));
        Arc::new(db)
    }

    fn engine_for(frames: Vec<RawFrame>) -> TelemetryEngine {
        let source = SimulatedSource::new(frames).with_timing(ReplayTiming::Immediate);
        TelemetryEngine::new(
            Box::new(source),
            Decoder::new(speed_database()),
            FrameStore::open_in_memory().unwrap(),
        )
    }

    fn wait_until_stopped(engine: &TelemetryEngine) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.state() != EngineState::Stopped {
            assert!(Instant::now() < deadline, "engine did not stop");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Source that reports one scripted poll per call, then end of stream
    struct ScriptedSource(std::collections::VecDeque<SourcePoll>);

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> SourcePoll {
            self.0.pop_front().unwrap_or(SourcePoll::EndOfStream)
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// Source that idles until stopped
    struct QuietSource;

    impl FrameSource for QuietSource {
        fn next_frame(&mut self) -> SourcePoll {
            thread::sleep(Duration::from_millis(5));
            SourcePoll::Idle
        }

        fn describe(&self) -> String {
            "quiet".to_string()
        }
    }

    #[test]
    fn test_runs_to_end_of_stream() {
        let mut engine = engine_for(vec![
            RawFrame::new(0x001, vec![1, 2, 3, 4], 2.0),
            RawFrame::new(0x002, vec![5, 6, 7, 8], 4.0),
            RawFrame::new(0x001, Vec::<u8>::new(), 6.0),
        ]);
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.start().unwrap();
        engine.join().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);

        let health = engine.health();
        assert_eq!(health.frames_received, 3);
        assert_eq!(health.frames_persisted, 3);
        assert_eq!(health.unknown_ids, 1);
        assert_eq!(health.malformed_frames, 1);

        let records = engine.query_recent(10).unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(records[2].status(), DecodeStatus::Malformed);
    }

    #[test]
    fn test_join_before_start_returns_immediately() {
        let mut engine = engine_for(Vec::new());
        engine.join().unwrap();
        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_start_while_running_is_rejected() {
        let mut engine = TelemetryEngine::new(
            Box::new(QuietSource),
            Decoder::new(speed_database()),
            FrameStore::open_in_memory().unwrap(),
        );
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(TelemetryError::AlreadyRunning)));

        engine.stop();
        engine.stop();
        engine.join().unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_restart_continues_from_returned_source() {
        let mut engine = TelemetryEngine::new(
            Box::new(QuietSource),
            Decoder::new(speed_database()),
            FrameStore::open_in_memory().unwrap(),
        );
        for _ in 0..2 {
            engine.start().unwrap();
            engine.stop();
            engine.join().unwrap();
        }
        assert_eq!(engine.health().frames_received, 0);
    }

    #[test]
    fn test_start_after_natural_exit_without_join() {
        let mut engine = engine_for(vec![RawFrame::new(0x001, vec![1], 0.0)]);
        engine.start().unwrap();
        wait_until_stopped(&engine);

        // The replay is exhausted, so the second run ends straight away
        engine.start().unwrap();
        engine.join().unwrap();
        assert_eq!(engine.store().len(), 1);
    }

    #[test]
    fn test_recoverable_faults_are_counted() {
        let script = vec![
            SourcePoll::Frame(RawFrame::new(0x001, vec![1], 0.0)),
            SourcePoll::Fault(SourceError::Recoverable("crc".into())),
            SourcePoll::Idle,
            SourcePoll::Frame(RawFrame::new(0x001, vec![2], 0.1)),
        ];
        let mut engine = TelemetryEngine::new(
            Box::new(ScriptedSource(script.into())),
            Decoder::new(speed_database()),
            FrameStore::open_in_memory().unwrap(),
        );

        engine.start().unwrap();
        engine.join().unwrap();

        assert_eq!(engine.health().source_faults, 1);
        assert_eq!(engine.health().frames_persisted, 2);
        assert!(engine.last_error().is_none());
    }

    #[test]
    fn test_fatal_source_fault_surfaces_in_join() {
        let script = vec![
            SourcePoll::Frame(RawFrame::new(0x001, vec![1], 0.0)),
            SourcePoll::Fault(SourceError::ConnectionLost("unplugged".into())),
            SourcePoll::Frame(RawFrame::new(0x001, vec![2], 0.1)),
        ];
        let mut engine = TelemetryEngine::new(
            Box::new(ScriptedSource(script.into())),
            Decoder::new(speed_database()),
            FrameStore::open_in_memory().unwrap(),
        );

        engine.start().unwrap();
        let err = engine.join().unwrap_err();
        assert!(matches!(err, TelemetryError::Fault(EngineFault::Source(_))));
        assert!(matches!(engine.last_error(), Some(EngineFault::Source(_))));
        assert_eq!(engine.state(), EngineState::Stopped);

        // Source faults do not poison queries
        assert_eq!(engine.query_recent(5).unwrap().len(), 1);
    }
}
