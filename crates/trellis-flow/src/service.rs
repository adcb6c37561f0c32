//! Public facade: request submission, response routing, and lifecycle.
//!
//! [`FlowService::start`] spawns the worker partitions and the timeout
//! tick task. Flow ids are consistently hashed across workers, so every
//! request, speaker response, and timeout for one flow lands on the same
//! single-threaded event loop; that placement is what enforces one live
//! operation per flow without a lock service.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use trellis_core::FlowId;

use crate::config::FlowServiceConfig;
use crate::dispatch::{SpeakerResponse, SwitchAgent};
use crate::error::{Error, Result};
use crate::history::{HistoryRecorder, HistorySink};
use crate::ledger::ResourceLedger;
use crate::resolver::PathResolver;
use crate::saga::orchestrator::Orchestrator;
use crate::saga::{transitions, FlowOperation, OperationResult, RequestPayload};
use crate::store::{FlowStore, TransactionRunner};
use crate::worker::{Worker, WorkerMessage};

/// A caller request for one flow lifecycle operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRequest {
    /// Flow the operation acts on.
    pub flow_id: FlowId,
    /// Kind-specific payload.
    pub payload: RequestPayload,
}

/// Terminal status reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// The operation completed.
    Success,
    /// The operation was rejected or rolled back.
    Error,
}

/// Terminal reply for one request.
///
/// Only the stable error type and message are exposed; internal retry
/// counts and intermediate states never leave the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowResponse {
    /// Flow the reply concerns.
    pub flow_id: FlowId,
    /// Terminal status.
    pub status: RequestStatus,
    /// Stable error type code, present on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Human-readable error message, present on error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FlowResponse {
    /// Builds an admission rejection.
    #[must_use]
    pub fn rejection(flow_id: FlowId, err: &Error) -> Self {
        Self {
            flow_id,
            status: RequestStatus::Error,
            error_type: Some(err.error_type().to_string()),
            error_message: Some(err.to_string()),
        }
    }

    /// Builds the reply for a terminal operation.
    #[must_use]
    pub fn from_operation(op: &FlowOperation) -> Self {
        match &op.result {
            OperationResult::Success => Self {
                flow_id: op.flow_id.clone(),
                status: RequestStatus::Success,
                error_type: None,
                error_message: None,
            },
            OperationResult::Error(cause) => Self {
                flow_id: op.flow_id.clone(),
                status: RequestStatus::Error,
                error_type: Some(cause.error_type.clone()),
                error_message: Some(cause.message.clone()),
            },
            // A finalized operation always carries a terminal result; a
            // pending one here is a bug, reported as such.
            OperationResult::Pending => Self {
                flow_id: op.flow_id.clone(),
                status: RequestStatus::Error,
                error_type: Some("INTERNAL_ERROR".to_string()),
                error_message: Some("operation finalized without a result".to_string()),
            },
        }
    }

    /// Returns true when the operation completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RequestStatus::Success
    }
}

/// Handle switch-agent transports use to deliver responses.
///
/// Cloneable and cheap; routes each response to the worker owning the
/// response's flow id.
#[derive(Clone)]
pub struct ResponseHandle {
    workers: Vec<mpsc::Sender<WorkerMessage>>,
}

impl ResponseHandle {
    /// Delivers one speaker response to its flow's partition.
    ///
    /// Delivery to a drained worker is dropped silently; the saga it
    /// belonged to has already terminated.
    pub async fn deliver(&self, response: SpeakerResponse) {
        let index = partition(&response.flow_id, self.workers.len());
        if self.workers[index]
            .send(WorkerMessage::Response(response))
            .await
            .is_err()
        {
            tracing::debug!(worker = index, "response dropped, worker drained");
        }
    }
}

/// The flow orchestration service.
pub struct FlowService {
    workers: Vec<mpsc::Sender<WorkerMessage>>,
    worker_handles: Vec<JoinHandle<()>>,
    tick_handle: JoinHandle<()>,
    history_handle: JoinHandle<()>,
    history: HistoryRecorder,
}

impl FlowService {
    /// Starts the service: validates the transition table, spawns the
    /// worker partitions, and starts the timeout tick task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the transition table fails its
    /// structural validation.
    pub fn start(
        store: Arc<dyn FlowStore>,
        resolver: Arc<dyn PathResolver>,
        agent: Arc<dyn SwitchAgent>,
        sink: Arc<dyn HistorySink>,
        config: FlowServiceConfig,
    ) -> Result<Self> {
        transitions::validate_table().map_err(Error::internal)?;

        let (history, history_handle) = HistoryRecorder::spawn(sink, config.history_buffer);
        let txn = TransactionRunner::new(
            config.transaction_retries,
            config.transaction_retry_delay(),
        );
        let ledger = ResourceLedger::new(store.clone(), txn.clone());
        let orchestrator = Orchestrator::new(
            store,
            ledger,
            resolver,
            agent,
            history.clone(),
            txn,
            config.clone(),
        );

        let worker_count = config.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        let mut worker_handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (tx, handle) = Worker::spawn(id, orchestrator.clone(), 256);
            workers.push(tx);
            worker_handles.push(handle);
        }

        let tick_handle = {
            let workers = workers.clone();
            let interval = config.tick_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let now = chrono::Utc::now();
                    for worker in &workers {
                        // A drained worker just means nothing left to time
                        // out in that partition.
                        let _ = worker.send(WorkerMessage::Tick(now)).await;
                    }
                }
            })
        };

        tracing::info!(workers = worker_count, "flow service started");
        Ok(Self {
            workers,
            worker_handles,
            tick_handle,
            history_handle,
            history,
        })
    }

    /// Submits a request and awaits its terminal reply.
    ///
    /// Admission rejections (busy flow, draining service) surface as error
    /// replies, not as `Err`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] if the owning worker has already
    /// drained.
    pub async fn submit(&self, request: FlowRequest) -> Result<FlowResponse> {
        let index = partition(&request.flow_id, self.workers.len());
        let (reply_tx, reply_rx) = oneshot::channel();
        self.workers[index]
            .send(WorkerMessage::Request {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        reply_rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Returns the handle switch-agent transports deliver responses to.
    #[must_use]
    pub fn response_handle(&self) -> ResponseHandle {
        ResponseHandle {
            workers: self.workers.clone(),
        }
    }

    /// Drains the service: stops admitting requests, lets in-flight sagas
    /// reach a terminal state, joins the workers, and flushes history.
    pub async fn shutdown(self) {
        tracing::info!("flow service shutting down");
        for worker in &self.workers {
            let _ = worker.send(WorkerMessage::Shutdown).await;
        }
        // Ticks must keep flowing while workers drain, or an in-flight
        // saga waiting on a dead switch would never time out.
        for handle in self.worker_handles {
            let _ = handle.await;
        }
        self.tick_handle.abort();

        // Closing the last recorder lets the drain task flush and finish.
        drop(self.history);
        let _ = self.history_handle.await;
        tracing::info!("flow service stopped");
    }
}

/// Consistent flow-id to worker assignment.
fn partition(flow_id: &FlowId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    flow_id.hash(&mut hasher);
    usize::try_from(hasher.finish() % workers.max(1) as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_stable_and_in_range() {
        let flow = FlowId::new("flow-123");
        let first = partition(&flow, 4);
        for _ in 0..10 {
            assert_eq!(partition(&flow, 4), first);
        }
        assert!(first < 4);
        assert_eq!(partition(&flow, 1), 0);
    }

    #[test]
    fn response_serialization_omits_empty_errors() {
        let response = FlowResponse {
            flow_id: FlowId::new("f1"),
            status: RequestStatus::Success,
            error_type: None,
            error_message: None,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("errorType"));
        assert!(json.contains("SUCCESS"));
    }

    #[test]
    fn rejection_carries_stable_code() {
        let response = FlowResponse::rejection(
            FlowId::new("f1"),
            &Error::FlowBusy {
                flow_id: FlowId::new("f1"),
            },
        );
        assert_eq!(response.error_type.as_deref(), Some("FLOW_BUSY"));
        assert!(!response.is_success());
    }
}
