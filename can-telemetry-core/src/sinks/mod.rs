//! Logging sinks
//!
//! Each sink owns a writer thread fed through a bounded queue. `emit` applies
//! backpressure by blocking on a full queue, but only for the sink's emit
//! timeout; after that the frame is dropped for this sink and counted as an
//! overflow. A stalled writer therefore costs the acquisition loop at most one
//! timeout per frame and never blocks it indefinitely.
//!
//! Closing is bounded the same way: a writer that has not drained within the
//! close timeout is detached and left to finish on its own.

use crate::types::{DecodedFrame, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub mod structured;
pub mod trace;

pub use structured::StructuredFileWriter;
pub use trace::TraceFileWriter;

/// How long `close` waits for a writer to drain before detaching it
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Destination a sink writes decoded frames to
pub trait FrameWriter: Send {
    fn write_frame(&mut self, frame: &DecodedFrame) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SinkCounters {
    written: AtomicU64,
    overflows: AtomicU64,
    write_errors: AtomicU64,
}

/// Snapshot of one sink's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub name: String,
    /// Frames the writer accepted
    pub written: u64,
    /// Frames dropped because the queue stayed full past the emit timeout
    pub overflows: u64,
    /// Frames the writer failed to write
    pub write_errors: u64,
}

/// Handle to a running sink
pub struct SinkHandle {
    name: String,
    sender: Option<Sender<DecodedFrame>>,
    worker: Option<JoinHandle<()>>,
    /// Disconnects when the writer thread exits
    finished: Receiver<()>,
    counters: Arc<SinkCounters>,
    emit_timeout: Duration,
    close_timeout: Duration,
}

impl SinkHandle {
    /// Start a writer thread for `writer`
    ///
    /// `capacity` frames may queue before `emit` starts blocking; a blocked
    /// `emit` gives up after `emit_timeout`.
    pub fn spawn<W>(
        name: impl Into<String>,
        writer: W,
        capacity: usize,
        emit_timeout: Duration,
    ) -> Result<Self>
    where
        W: FrameWriter + 'static,
    {
        let name = name.into();
        let (sender, receiver) = bounded(capacity.max(1));
        let counters = Arc::new(SinkCounters::default());

        let (finished_tx, finished) = bounded::<()>(0);

        let worker = {
            let name = name.clone();
            let counters = Arc::clone(&counters);
            thread::Builder::new()
                .name(format!("sink-{}", name))
                .spawn(move || {
                    let _finished = finished_tx;
                    run_writer(&name, writer, receiver, &counters)
                })?
        };

        log::debug!("Sink '{}' started (queue {}, timeout {:?})", name, capacity, emit_timeout);

        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
            finished,
            counters,
            emit_timeout,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        })
    }

    /// Builder method: bound how long `close` waits for the writer
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `frame` for writing; returns false if it was dropped
    pub fn emit(&self, frame: &DecodedFrame) -> bool {
        let Some(sender) = &self.sender else {
            self.record_overflow();
            return false;
        };

        match sender.send_timeout(frame.clone(), self.emit_timeout) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_) | SendTimeoutError::Disconnected(_)) => {
                self.record_overflow();
                false
            }
        }
    }

    fn record_overflow(&self) {
        let previous = self.counters.overflows.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            log::warn!("Sink '{}' is not keeping up, dropping frames", self.name);
        }
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            name: self.name.clone(),
            written: self.counters.written.load(Ordering::Relaxed),
            overflows: self.counters.overflows.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue, flush the writer and stop its thread
    ///
    /// Waits at most the close timeout; returns false if the writer was
    /// still busy and had to be detached.
    pub fn close(&mut self) -> bool {
        self.sender.take();
        let Some(worker) = self.worker.take() else {
            return true;
        };

        match self.finished.recv_timeout(self.close_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Sink '{}' did not finish within {:?}, detaching its writer thread",
                    self.name,
                    self.close_timeout
                );
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join().is_err() {
                    log::error!("Sink '{}' writer thread panicked", self.name);
                }
                true
            }
        }
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_writer<W: FrameWriter>(
    name: &str,
    mut writer: W,
    receiver: Receiver<DecodedFrame>,
    counters: &SinkCounters,
) {
    for frame in receiver.iter() {
        match writer.write_frame(&frame) {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.write_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Sink '{}' write failed: {}", name, e);
            }
        }

        if receiver.is_empty() {
            if let Err(e) = writer.flush() {
                log::warn!("Sink '{}' flush failed: {}", name, e);
            }
        }
    }

    if let Err(e) = writer.flush() {
        log::warn!("Sink '{}' final flush failed: {}", name, e);
    }
    log::debug!("Sink '{}' stopped", name);
}
