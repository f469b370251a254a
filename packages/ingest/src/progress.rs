//! Progress reporting for long-running ingestion.
//!
//! [`ProgressCallback`] decouples record-level progress from any rendering
//! backend (an `indicatif` bar in the CLI, nothing in the server).
//! [`EventSink`] carries the batch lifecycle events of an interactive
//! upload to whoever is listening.

use std::sync::Arc;

use address_map_ingest_models::ProgressEvent;
use tokio::sync::mpsc;

/// Receives record-level progress while datasets are written.
///
/// Shared across worker tasks behind an `Arc`.
pub trait ProgressCallback: Send + Sync {
    /// Sets the expected number of units.
    fn set_total(&self, total: u64);

    /// Moves to an absolute position.
    fn set_position(&self, pos: u64);

    /// Adds `delta` completed units.
    fn inc(&self, delta: u64);

    /// Replaces the status text.
    fn set_message(&self, msg: String);

    /// Completes, leaving `msg` visible.
    fn finish(&self, msg: String);

    /// Completes and hides the indicator.
    fn finish_and_clear(&self);
}

/// Discards all progress.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn set_position(&self, _pos: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
    fn finish_and_clear(&self) {}
}

/// A shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}

/// Sending half of a batch's [`ProgressEvent`] stream.
///
/// Emitting never fails: once the receiver is gone, events are dropped
/// and server-side work carries on.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl EventSink {
    /// Creates a connected sink and receiver.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emits an event.
    pub fn emit(&self, event: ProgressEvent) {
        let kind = event.event_type();
        if self.tx.send(event).is_err() {
            log::debug!("Progress listener disconnected; dropping {kind} event");
        }
    }
}
