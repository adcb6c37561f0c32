//! Partitioned worker event loop.
//!
//! Each worker owns a disjoint partition of the flow-id space and is the
//! only task that mutates the sagas, the busy set, and the correlation
//! router for its partition. Requests, responses, timeout ticks, and the
//! shutdown signal all arrive through one mpsc channel, so no locking is
//! needed: the channel is the serialization point, and one live operation
//! per flow id falls out of the busy set being single-owner.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use trellis_core::{FlowId, OperationId};

use crate::correlation::{CorrelationKey, CorrelationRouter};
use crate::dispatch::SpeakerResponse;
use crate::error::Error;
use crate::saga::orchestrator::Orchestrator;
use crate::saga::{Event, FlowOperation};
use crate::service::{FlowRequest, FlowResponse};

/// Messages delivered to a worker's event loop.
#[derive(Debug)]
pub enum WorkerMessage {
    /// A caller request with its reply slot.
    Request {
        /// The admitted request.
        request: FlowRequest,
        /// Completed when the operation reaches a terminal state (or is
        /// rejected at admission).
        reply: oneshot::Sender<FlowResponse>,
    },
    /// A speaker response routed to this partition by flow id.
    Response(SpeakerResponse),
    /// Periodic timeout scan.
    Tick(DateTime<Utc>),
    /// Stop admitting requests; drain in-flight sagas, then exit.
    Shutdown,
}

/// One partition's event loop state.
pub struct Worker {
    id: usize,
    orchestrator: Orchestrator,
    router: CorrelationRouter,
    operations: HashMap<OperationId, FlowOperation>,
    busy: HashMap<FlowId, OperationId>,
    replies: HashMap<OperationId, oneshot::Sender<FlowResponse>>,
    draining: bool,
}

impl Worker {
    /// Spawns a worker task, returning its message channel and handle.
    #[must_use]
    pub fn spawn(
        id: usize,
        orchestrator: Orchestrator,
        channel_capacity: usize,
    ) -> (mpsc::Sender<WorkerMessage>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(channel_capacity.max(1));
        let worker = Self {
            id,
            orchestrator,
            router: CorrelationRouter::new(),
            operations: HashMap::new(),
            busy: HashMap::new(),
            replies: HashMap::new(),
            draining: false,
        };
        let handle = tokio::spawn(worker.run(rx));
        (tx, handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WorkerMessage>) {
        tracing::debug!(worker = self.id, "worker started");
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Request { request, reply } => {
                    self.on_request(request, reply).await;
                }
                WorkerMessage::Response(response) => self.on_response(response).await,
                WorkerMessage::Tick(now) => self.on_tick(now).await,
                WorkerMessage::Shutdown => {
                    tracing::info!(
                        worker = self.id,
                        in_flight = self.operations.len(),
                        "worker draining"
                    );
                    self.draining = true;
                }
            }
            if self.draining && self.operations.is_empty() {
                break;
            }
        }
        tracing::debug!(worker = self.id, "worker stopped");
    }

    async fn on_request(&mut self, request: FlowRequest, reply: oneshot::Sender<FlowResponse>) {
        if self.draining {
            let _ = reply.send(FlowResponse::rejection(
                request.flow_id.clone(),
                &Error::ShuttingDown,
            ));
            return;
        }
        if let Some(live) = self.busy.get(&request.flow_id) {
            tracing::info!(
                worker = self.id,
                flow_id = %request.flow_id,
                live_operation = %live,
                "request rejected, flow busy"
            );
            let _ = reply.send(FlowResponse::rejection(
                request.flow_id.clone(),
                &Error::FlowBusy {
                    flow_id: request.flow_id.clone(),
                },
            ));
            return;
        }

        let mut op = FlowOperation::new(request.flow_id.clone(), &request.payload);
        tracing::info!(
            worker = self.id,
            operation_id = %op.operation_id,
            flow_id = %op.flow_id,
            kind = %op.kind,
            "operation admitted"
        );
        self.busy.insert(op.flow_id.clone(), op.operation_id);
        self.replies.insert(op.operation_id, reply);

        self.orchestrator
            .advance(&mut op, &mut self.router, Event::Start)
            .await;
        self.park_or_finalize(op);
    }

    async fn on_response(&mut self, response: SpeakerResponse) {
        let key = CorrelationKey::new(response.command_id, response.operation_id);
        if !self.router.consume(&key) {
            tracing::debug!(
                worker = self.id,
                key = %key,
                "late or duplicate response dropped"
            );
            return;
        }
        let Some(mut op) = self.operations.remove(&response.operation_id) else {
            tracing::debug!(
                worker = self.id,
                operation_id = %response.operation_id,
                "response for unknown operation dropped"
            );
            return;
        };
        self.orchestrator
            .advance(&mut op, &mut self.router, Event::Response(response))
            .await;
        self.park_or_finalize(op);
    }

    async fn on_tick(&mut self, now: DateTime<Utc>) {
        for key in self.router.fire_timeouts(now) {
            let Some(mut op) = self.operations.remove(&key.operation_id) else {
                continue;
            };
            self.orchestrator
                .advance(&mut op, &mut self.router, Event::Timeout(key.command_id))
                .await;
            self.park_or_finalize(op);
        }
    }

    fn park_or_finalize(&mut self, op: FlowOperation) {
        if !op.is_terminal() {
            self.operations.insert(op.operation_id, op);
            return;
        }
        self.router.cancel_operation(op.operation_id);
        self.busy.remove(&op.flow_id);
        if let Some(reply) = self.replies.remove(&op.operation_id) {
            let _ = reply.send(FlowResponse::from_operation(&op));
        }
        tracing::debug!(
            worker = self.id,
            operation_id = %op.operation_id,
            flow_id = %op.flow_id,
            state = %op.state,
            "operation finalized"
        );
    }
}
