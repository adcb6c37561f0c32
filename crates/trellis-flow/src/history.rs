//! Append-only audit trail of flow operation transitions.
//!
//! History is fire-and-forget from the orchestrator's perspective: entries
//! flow through a bounded channel into a sink, and a full channel drops
//! the entry with a warning. Loss of a history write never fails or rolls
//! back the operation it documents.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use trellis_core::FlowId;

/// One immutable audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Flow the entry concerns.
    pub flow_id: FlowId,
    /// Short action label (e.g. "path_allocated").
    pub action: String,
    /// Human-readable description.
    pub description: String,
    /// Optional structured dump of before/after path state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump: Option<serde_json::Value>,
}

/// Destination for history entries.
pub trait HistorySink: Send + Sync {
    /// Appends one entry. Must not block for long and must not fail the
    /// caller.
    fn append(&self, entry: HistoryEntry);
}

/// In-memory sink for tests and development.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: Mutex<Vec<HistoryEntry>>,
}

impl InMemoryHistory {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the recorded entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the entries recorded for one flow.
    #[must_use]
    pub fn entries_for(&self, flow_id: &FlowId) -> Vec<HistoryEntry> {
        self.entries()
            .into_iter()
            .filter(|e| &e.flow_id == flow_id)
            .collect()
    }
}

impl HistorySink for InMemoryHistory {
    fn append(&self, entry: HistoryEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

/// Handle the orchestrator records through.
///
/// Cloneable; all clones feed the same bounded channel. Dropping every
/// recorder closes the channel and lets the drain task finish, which is
/// how shutdown flushes history.
#[derive(Debug, Clone)]
pub struct HistoryRecorder {
    tx: mpsc::Sender<HistoryEntry>,
}

impl HistoryRecorder {
    /// Creates a recorder draining into the sink.
    ///
    /// Spawns the drain task on the current tokio runtime and returns the
    /// recorder together with the task handle (awaited during shutdown).
    #[must_use]
    pub fn spawn(
        sink: std::sync::Arc<dyn HistorySink>,
        buffer: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<HistoryEntry>(buffer.max(1));
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                sink.append(entry);
            }
        });
        (Self { tx }, handle)
    }

    /// Records one entry. Never blocks and never fails the caller.
    pub fn record(
        &self,
        flow_id: &FlowId,
        action: &str,
        description: impl Into<String>,
        dump: Option<serde_json::Value>,
    ) {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            flow_id: flow_id.clone(),
            action: action.to_string(),
            description: description.into(),
            dump,
        };
        if let Err(err) = self.tx.try_send(entry) {
            tracing::warn!(
                flow_id = %flow_id,
                action,
                error = %err,
                "history entry dropped"
            );
        }
    }
}
