//! Events emitted by the executor for external observers.
//!
//! The executor pushes [`ExecutorEvent`]s into an unbounded tokio mpsc channel. Sending
//! never blocks and never waits for the observer; a dropped receiver is ignored. The
//! observer talks back only through [`crate::abort::AbortHandle`].
//!
//! ```text
//! Executor task                        Observer (GUI, CLI, test)
//! -------------                        -------------------------
//! emit(Progress)      ── unbounded ──>  recv().await
//! emit(ItemState)     ── unbounded ──>  recv().await
//!        ^                                   │
//!        └──────── AbortHandle::abort() ─────┘
//! ```

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::sequence::{ItemState, NodePath};
use crate::sequencer::output::SummaryRecord;

/// Notification from the executor.
#[derive(Debug, Clone, Serialize)]
pub enum ExecutorEvent {
    /// Human readable status line
    Message(String),
    /// Progress of the current step
    Progress {
        /// Current value
        value: usize,
        /// Maximum value
        maximum: usize,
    },
    /// A node changed state
    ItemState {
        /// Node address
        path: NodePath,
        /// New state
        state: Option<ItemState>,
    },
    /// A contact is being re-contacted
    ItemRecontact {
        /// Contact address
        path: NodePath,
        /// Number of re-contacts so far
        count: u32,
    },
    /// A measurement is being re-measured
    ItemRemeasure {
        /// Measurement address
        path: NodePath,
        /// Number of re-measurements so far
        count: u32,
    },
    /// Show the live view of a measurement
    ShowItem(NodePath),
    /// Hide the live view of a measurement
    HideItem(NodePath),
    /// A plotted point
    Reading {
        /// Measurement address
        path: NodePath,
        /// Series name
        name: String,
        /// X value
        x: f64,
        /// Y value
        y: f64,
    },
    /// Partial update of the instrument status display
    InstrumentState(IndexMap<String, serde_json::Value>),
    /// Request a plot snapshot
    SaveImage {
        /// Measurement address
        path: NodePath,
        /// Target file
        filename: PathBuf,
    },
    /// One-line summary of a completed measurement
    Summary(SummaryRecord),
    /// The run failed (emitted at most once per run)
    Failed(String),
    /// The run is over (always emitted last)
    Finished,
}

/// Cheap, cloneable emitter. Never blocks.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<ExecutorEvent>>,
}

impl EventSender {
    /// Create a connected sender/receiver pair.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sender that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit an event. A closed channel is ignored.
    pub fn emit(&self, event: ExecutorEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Emit a status message.
    pub fn message(&self, text: impl Into<String>) {
        self.emit(ExecutorEvent::Message(text.into()));
    }

    /// Emit progress.
    pub fn progress(&self, value: usize, maximum: usize) {
        self.emit(ExecutorEvent::Progress { value, maximum });
    }
}

/// Drain every event currently queued.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ExecutorEvent>) -> Vec<ExecutorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
