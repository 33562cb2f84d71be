//! Progress reporting and cooperative cancellation.
//!
//! Long operations report progress in units (strips, tiles or scanline
//! batches) and poll a [`CancelFlag`] at the same granularity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::CodecError;

/// Shared cancellation request. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), CodecError> {
        if self.is_cancelled() {
            Err(CodecError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Receiver of progress updates.
pub trait ProgressSink: Send {
    fn begin(&mut self, total_units: u64);
    fn advance(&mut self, units: u64);
    fn finish(&mut self);
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn begin(&mut self, _total_units: u64) {}
    fn advance(&mut self, _units: u64) {}
    fn finish(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { total: u64 },
    Advanced { done: u64, total: u64 },
    Finished,
}

/// Forwards progress to a channel, typically read on an async task.
///
/// A closed receiver is not an error; events are dropped.
pub struct ChannelProgress {
    tx: UnboundedSender<ProgressEvent>,
    total: u64,
    done: u64,
}

impl ChannelProgress {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx, total: 0, done: 0 }
    }
}

impl ProgressSink for ChannelProgress {
    fn begin(&mut self, total_units: u64) {
        self.total = total_units;
        self.done = 0;
        let _ = self.tx.send(ProgressEvent::Started { total: total_units });
    }

    fn advance(&mut self, units: u64) {
        self.done = (self.done + units).min(self.total);
        let _ = self.tx.send(ProgressEvent::Advanced {
            done: self.done,
            total: self.total,
        });
    }

    fn finish(&mut self) {
        let _ = self.tx.send(ProgressEvent::Finished);
    }
}
