//! Simulated frame source
//!
//! Replays a preloaded, time-ordered capture. Each frame is released when its
//! recorded timestamp comes due (see [`ReplayTiming`]); long waits are cut
//! into poll-interval slices so the engine can stop a replay mid-gap.

use super::{FrameSource, SourcePoll};
use crate::config::{filters_accept, CanFilter, ReplayTiming};
use crate::types::{RawFrame, Result, TelemetryError};
use std::collections::VecDeque;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Replays a preloaded frame sequence
#[derive(Debug)]
pub struct SimulatedSource {
    frames: VecDeque<RawFrame>,
    timing: ReplayTiming,
    poll_interval: Duration,
    /// Stream start instant and the timestamp mapped onto it
    anchor: Option<(Instant, f64)>,
}

impl SimulatedSource {
    /// Create a source replaying `frames` in timestamp order
    pub fn new(mut frames: Vec<RawFrame>) -> Self {
        frames.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Self {
            frames: frames.into(),
            timing: ReplayTiming::default(),
            poll_interval: Duration::from_millis(100),
            anchor: None,
        }
    }

    /// Load a JSON array of frames
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let frames: Vec<RawFrame> = serde_json::from_str(&content).map_err(|e| {
            TelemetryError::InvalidData(format!("Invalid frame file {:?}: {}", path, e))
        })?;
        log::info!("Loaded {} simulated frames from {:?}", frames.len(), path);
        Ok(Self::new(frames))
    }

    /// Builder method: set the replay timing
    pub fn with_timing(mut self, timing: ReplayTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Builder method: set the longest single sleep
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Builder method: drop every frame no filter accepts
    pub fn with_filters(mut self, filters: &[CanFilter]) -> Self {
        let before = self.frames.len();
        self.frames.retain(|frame| filters_accept(filters, frame));
        if self.frames.len() < before {
            log::debug!("Receive filters removed {} simulated frames", before - self.frames.len());
        }
        self
    }

    /// Frames not yet replayed
    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    fn time_until_due(&mut self, timestamp: f64) -> Duration {
        let seconds = match self.timing {
            ReplayTiming::Immediate => return Duration::ZERO,
            ReplayTiming::Relative => {
                let (start, first_ts) = *self
                    .anchor
                    .get_or_insert_with(|| (Instant::now(), timestamp));
                let offset = seconds_to_duration(timestamp - first_ts);
                let due = start + offset;
                return due.saturating_duration_since(Instant::now());
            }
            ReplayTiming::Absolute => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                timestamp - now
            }
        };
        seconds_to_duration(seconds)
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::ZERO)
}

impl FrameSource for SimulatedSource {
    fn next_frame(&mut self) -> SourcePoll {
        let Some(timestamp) = self.frames.front().map(|f| f.timestamp) else {
            return SourcePoll::EndOfStream;
        };

        let wait = self.time_until_due(timestamp);
        if !wait.is_zero() {
            let slice = wait.min(self.poll_interval);
            thread::sleep(slice);
            if slice < wait {
                return SourcePoll::Idle;
            }
        }

        match self.frames.pop_front() {
            Some(frame) => SourcePoll::Frame(frame),
            None => SourcePoll::EndOfStream,
        }
    }

    fn describe(&self) -> String {
        format!(
            "simulated ({} frames pending, {:?} timing)",
            self.frames.len(),
            self.timing
        )
    }
}
