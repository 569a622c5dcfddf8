//! Live frame source
//!
//! Wraps a hardware adapter behind a bounded blocking receive. The adapter
//! itself (driver, kernel socket, vendor library) is outside this crate; it
//! only has to implement [`BusAdapter`].

use super::{FrameSource, SourcePoll};
use crate::config::{filters_accept, CanFilter};
use crate::types::{RawFrame, SourceError};
use std::time::Duration;

/// A physical or virtual bus connection
pub trait BusAdapter: Send {
    /// Block up to `timeout` for one frame; `Ok(None)` means the wait elapsed
    fn receive(&mut self, timeout: Duration) -> Result<Option<RawFrame>, SourceError>;

    /// Install acceptance filters in the adapter, if it can filter in hardware
    fn set_filters(&mut self, _filters: &[CanFilter]) -> Result<(), SourceError> {
        Ok(())
    }

    /// Human-readable adapter name
    fn name(&self) -> String;
}

/// Frame source backed by a live adapter
pub struct LiveSource<A: BusAdapter> {
    adapter: A,
    receive_timeout: Duration,
    filters: Vec<CanFilter>,
    connection_lost: bool,
}

impl<A: BusAdapter> LiveSource<A> {
    pub fn new(adapter: A, receive_timeout: Duration) -> Self {
        Self {
            adapter,
            receive_timeout,
            filters: Vec::new(),
            connection_lost: false,
        }
    }

    /// Builder method: pass only frames accepted by `filters`
    ///
    /// Filters are handed to the adapter as well; frames that slip past it
    /// are still dropped here and reported as an idle poll.
    pub fn with_filters(mut self, filters: &[CanFilter]) -> Result<Self, SourceError> {
        self.adapter.set_filters(filters)?;
        self.filters = filters.to_vec();
        Ok(self)
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }
}

impl<A: BusAdapter> FrameSource for LiveSource<A> {
    fn next_frame(&mut self) -> SourcePoll {
        if self.connection_lost {
            return SourcePoll::EndOfStream;
        }

        match self.adapter.receive(self.receive_timeout) {
            Ok(Some(frame)) if filters_accept(&self.filters, &frame) => SourcePoll::Frame(frame),
            Ok(Some(_)) | Ok(None) => SourcePoll::Idle,
            Err(err) => {
                if err.is_fatal() {
                    log::error!("{}: {}", self.adapter.name(), err);
                    self.connection_lost = true;
                } else {
                    log::warn!("{}: {}", self.adapter.name(), err);
                }
                SourcePoll::Fault(err)
            }
        }
    }

    fn describe(&self) -> String {
        format!("live {} (timeout {:?})", self.adapter.name(), self.receive_timeout)
    }
}
