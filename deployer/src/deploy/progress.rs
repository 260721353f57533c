//! Progress transport
//!
//! An ordered, single-producer event channel with one consumer per job. The
//! consumer may go away at any time; the producer keeps going and later
//! events are dropped.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::models::progress::ProgressEvent;

/// Open a progress channel for one job
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressSender {
            tx,
            last_rank: AtomicU8::new(0),
            finished: AtomicBool::new(false),
        },
        ProgressReceiver { rx },
    )
}

/// Producing half. Not `Clone`: a job has exactly one writer.
#[derive(Debug)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    last_rank: AtomicU8,
    finished: AtomicBool,
}

impl ProgressSender {
    /// Send an event. Returns whether it was delivered to a live consumer.
    ///
    /// Events after a terminal event, and events that would move the stage
    /// backwards, are dropped.
    pub fn emit(&self, event: ProgressEvent) -> bool {
        if self.finished.load(Ordering::Acquire) {
            trace!("Dropping event after terminal event: {}", event.message);
            return false;
        }

        let rank = event.stage.rank();
        if rank < self.last_rank.load(Ordering::Acquire) {
            warn!(
                "Dropping out of order {} event: {}",
                event.stage.as_str(),
                event.message
            );
            return false;
        }
        self.last_rank.store(rank, Ordering::Release);

        if event.is_terminal() {
            self.finished.store(true, Ordering::Release);
        }

        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                trace!("No progress subscriber, dropped: {}", e.0.message);
                false
            }
        }
    }

    /// Whether a terminal event has been emitted
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Whether the consumer is still attached
    pub fn has_subscriber(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Consuming half
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressReceiver {
    /// Next event, `None` once the job's sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Read every event until the sender is dropped
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}
