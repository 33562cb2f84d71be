//! Async façade over the blocking codec.
//!
//! Each decode or export runs on its own blocking worker thread via
//! [`tokio::task::spawn_blocking`]. The caller keeps a [`TaskHandle`]: it
//! receives progress events, can request cancellation, and awaits the
//! result.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::codec::{decode_with, DecodeOptions, Decoded};
use crate::error::CodecError;
use crate::image::RasterImage;
use crate::metadata::MetadataBundle;

use super::exporter::{AtomicExporter, ExportOptions, ExportReport};
use super::progress::{CancelFlag, ChannelProgress, ProgressEvent, ProgressSink};

/// Everything an export needs, owned so it can move to a worker thread.
pub struct ExportTask {
    pub image: Arc<RasterImage>,
    pub metadata: MetadataBundle,
    pub destination: PathBuf,
    pub options: ExportOptions,
}

/// A file to open on a worker thread.
#[derive(Debug, Clone)]
pub struct DecodeTask {
    pub path: PathBuf,
    pub options: DecodeOptions,
}

/// A running operation.
pub struct TaskHandle<T> {
    pub progress: UnboundedReceiver<ProgressEvent>,
    cancel: CancelFlag,
    join: JoinHandle<Result<T, CodecError>>,
}

impl<T> TaskHandle<T> {
    /// Request cancellation. The operation stops at its next unit boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Wait for the operation to finish.
    ///
    /// # Errors
    /// The operation's own error, or `Worker` if the worker thread panicked
    /// or was aborted.
    pub async fn join(self) -> Result<T, CodecError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(CodecError::Worker(e.to_string())),
        }
    }
}

/// Run an export on a blocking worker thread.
///
/// Must be called from within a tokio runtime.
pub fn spawn_export(task: ExportTask) -> TaskHandle<ExportReport> {
    spawn_with_progress(CancelFlag::new(), move |progress, cancel| {
        debug!(path = %task.destination.display(), "export worker started");
        AtomicExporter::new(task.options).export(
            &task.image,
            &task.metadata,
            &task.destination,
            progress,
            cancel,
        )
    })
}

/// Open a file on a blocking worker thread.
///
/// Decoding only reads headers and metadata, so it reports a single unit.
/// Must be called from within a tokio runtime.
pub fn spawn_decode(task: DecodeTask) -> TaskHandle<Decoded> {
    spawn_with_progress(CancelFlag::new(), move |progress, cancel| {
        debug!(path = %task.path.display(), "decode worker started");
        progress.begin(1);
        cancel.check()?;
        let decoded = decode_with(&task.path, &task.options)?;
        progress.advance(1);
        progress.finish();
        Ok(decoded)
    })
}

fn spawn_with_progress<T, F>(cancel: CancelFlag, work: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&mut ChannelProgress, &CancelFlag) -> Result<T, CodecError> + Send + 'static,
{
    let (tx, rx) = unbounded_channel();
    let worker_cancel = cancel.clone();
    let join = tokio::task::spawn_blocking(move || {
        let mut progress = ChannelProgress::new(tx);
        work(&mut progress, &worker_cancel)
    });
    TaskHandle {
        progress: rx,
        cancel,
        join,
    }
}
