//! Flow-lifecycle saga: per-operation state, events, and the transition
//! table.
//!
//! One [`FlowOperation`] is created per admitted request and driven by the
//! [`Orchestrator`](orchestrator::Orchestrator) through an explicit state
//! machine. States follow a shared shape across operation kinds:
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌────────────────────┐
//! │ VALIDATE │──►│ ALLOCATE_PRIMARY │──►│ ALLOCATE_PROTECTED │
//! └──────────┘   └──────────────────┘   └────────────────────┘
//!      │                  │ (same path found: reroute only)     │
//!      │                  └───────────────────────────┐         │
//!      ▼ (delete)                                     │         ▼
//! ┌──────────────┐   ┌─────────────────┐   ┌──────────┴─────────┐
//! │ REMOVE_RULES │◄──│ VALIDATE_RULES  │◄──│ INSTALL_* (2 steps)│
//! └──────────────┘   └─────────────────┘   └────────────────────┘
//!      │                     │ (create)
//!      ▼                     ▼
//! ┌──────────┐          ┌──────────┐
//! │ COMPLETE │          │ COMPLETE │
//! └──────────┘          └──────────┘
//!
//! Any step failure:  * ──► FAILED ──► ROLLBACK ──► REVERTED
//! ```
//!
//! Unmodeled `(state, event)` pairs are logged and ignored; the FSM never
//! advances silently.

pub mod commands;
pub mod orchestrator;
pub mod transitions;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_core::{CommandId, Cookie, FlowId, OperationId, SwitchId};

use crate::dispatch::{SpeakerResponse, StepTracker};
use crate::model::{Flow, FlowSpec, ResourceGrant};

/// The kind of lifecycle operation a saga performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Provision a new flow.
    Create,
    /// Tear down an existing flow.
    Delete,
    /// Move an existing flow to a freshly computed path.
    Reroute,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Reroute => write!(f, "REROUTE"),
        }
    }
}

/// Saga state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaState {
    /// Checking the request against current flow state.
    Validate,
    /// Resolving and reserving the primary path.
    AllocatePrimary,
    /// Resolving and reserving the protected path.
    AllocateProtected,
    /// Waiting for transit/egress rule installation responses.
    InstallNonIngress,
    /// Waiting for ingress rule and meter installation responses.
    InstallIngress,
    /// Waiting for rule verification responses.
    ValidateRules,
    /// Waiting for rule removal responses.
    RemoveRules,
    /// Terminal success.
    Complete,
    /// A step failed; cause recorded, rollback not yet started.
    Failed,
    /// Compensating: releasing grants and removing installed rules.
    Rollback,
    /// Terminal failure after compensation.
    Reverted,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Reverted)
    }

    /// Returns true for states parked awaiting speaker responses.
    #[must_use]
    pub const fn is_wait_state(&self) -> bool {
        matches!(
            self,
            Self::InstallNonIngress | Self::InstallIngress | Self::ValidateRules | Self::RemoveRules
        )
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Validate => "VALIDATE",
            Self::AllocatePrimary => "ALLOCATE_PRIMARY",
            Self::AllocateProtected => "ALLOCATE_PROTECTED",
            Self::InstallNonIngress => "INSTALL_NON_INGRESS",
            Self::InstallIngress => "INSTALL_INGRESS",
            Self::ValidateRules => "VALIDATE_RULES",
            Self::RemoveRules => "REMOVE_RULES",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Rollback => "ROLLBACK",
            Self::Reverted => "REVERTED",
        };
        write!(f, "{name}")
    }
}

/// Events that drive the saga.
#[derive(Debug, Clone)]
pub enum Event {
    /// The operation was admitted; run the first step.
    Start,
    /// Internal continuation between synchronous states.
    Next,
    /// The active step resolved every command successfully.
    StepCompleted,
    /// The active step failed terminally.
    StepFailed(FailureCause),
    /// Reroute resolved a path identical to the committed one.
    SamePathFound,
    /// A speaker response was routed to this operation.
    Response(SpeakerResponse),
    /// A command deadline expired without a response.
    Timeout(CommandId),
    /// Compensation finished.
    RollbackDone,
}

impl Event {
    /// Short label for logging.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Next => "next",
            Self::StepCompleted => "step_completed",
            Self::StepFailed(_) => "step_failed",
            Self::SamePathFound => "same_path_found",
            Self::Response(_) => "response",
            Self::Timeout(_) => "timeout",
            Self::RollbackDone => "rollback_done",
        }
    }
}

/// Why an operation failed; carried into the terminal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureCause {
    /// Stable caller-visible error type code.
    pub error_type: String,
    /// Human-readable message.
    pub message: String,
}

impl FailureCause {
    /// Builds a cause from a domain error.
    #[must_use]
    pub fn from_error(err: &crate::error::Error) -> Self {
        Self {
            error_type: err.error_type().to_string(),
            message: err.to_string(),
        }
    }
}

/// Final outcome of a saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// Still in flight.
    Pending,
    /// Reached `Complete`.
    Success,
    /// Reached `Reverted` with the recorded cause.
    Error(FailureCause),
}

/// Kind-specific request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPayload {
    /// Create a flow from a spec.
    Create(FlowSpec),
    /// Delete the flow.
    Delete,
    /// Reroute the flow.
    Reroute {
        /// Recreate rules even when the resolved path equals the current
        /// one (used when the flow is down).
        #[serde(default)]
        force_recreate: bool,
    },
}

impl RequestPayload {
    /// The operation kind this payload requests.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        match self {
            Self::Create(_) => OperationKind::Create,
            Self::Delete => OperationKind::Delete,
            Self::Reroute { .. } => OperationKind::Reroute,
        }
    }
}

/// One saga instance: the state of a single flow lifecycle operation.
///
/// Mutated only by the worker that owns the flow id's partition.
#[derive(Debug)]
pub struct FlowOperation {
    /// Unique id of this operation.
    pub operation_id: OperationId,
    /// Flow the operation acts on.
    pub flow_id: FlowId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Current FSM state.
    pub state: SagaState,
    /// When the operation was admitted.
    pub started_at: DateTime<Utc>,
    /// Final outcome, `Pending` until a terminal state is reached.
    pub result: OperationResult,

    pub(crate) spec: Option<FlowSpec>,
    pub(crate) force_recreate: bool,
    pub(crate) flow: Option<Flow>,
    pub(crate) step: Option<StepTracker>,
    pub(crate) new_primary: Option<ResourceGrant>,
    pub(crate) new_protected: Option<ResourceGrant>,
    pub(crate) old_grants: Vec<ResourceGrant>,
    pub(crate) installed: Vec<(SwitchId, Cookie)>,
    pub(crate) rejected: Vec<ResourceGrant>,
    pub(crate) failure: Option<FailureCause>,
    pub(crate) same_path: bool,
}

impl FlowOperation {
    /// Creates a fresh saga instance for a request.
    #[must_use]
    pub fn new(flow_id: FlowId, payload: &RequestPayload) -> Self {
        let kind = payload.kind();
        let (spec, force_recreate) = match payload {
            RequestPayload::Create(spec) => (Some(spec.clone()), false),
            RequestPayload::Delete => (None, false),
            RequestPayload::Reroute { force_recreate } => (None, *force_recreate),
        };
        Self {
            operation_id: OperationId::generate(),
            flow_id,
            kind,
            state: SagaState::Validate,
            started_at: Utc::now(),
            result: OperationResult::Pending,
            spec,
            force_recreate,
            flow: None,
            step: None,
            new_primary: None,
            new_protected: None,
            old_grants: Vec::new(),
            installed: Vec::new(),
            rejected: Vec::new(),
            failure: None,
            same_path: false,
        }
    }

    /// Returns true once the saga reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether this operation allocates a protected path.
    #[must_use]
    pub fn wants_protected(&self) -> bool {
        self.spec
            .as_ref()
            .map(|s| s.protected_path)
            .or_else(|| self.flow.as_ref().map(|f| f.protected_path))
            .unwrap_or(false)
    }

    /// Grants reserved by this operation and not yet committed.
    #[must_use]
    pub fn allocated_resources(&self) -> Vec<&ResourceGrant> {
        self.new_primary
            .iter()
            .chain(self.new_protected.iter())
            .collect()
    }

    /// Grants released (or queued for release) during rollback.
    #[must_use]
    pub fn rejected_resources(&self) -> &[ResourceGrant] {
        &self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FlowEndpoint;

    #[test]
    fn terminal_states() {
        assert!(SagaState::Complete.is_terminal());
        assert!(SagaState::Reverted.is_terminal());
        assert!(!SagaState::Rollback.is_terminal());
        assert!(!SagaState::Validate.is_terminal());
    }

    #[test]
    fn wait_states() {
        assert!(SagaState::InstallIngress.is_wait_state());
        assert!(SagaState::RemoveRules.is_wait_state());
        assert!(!SagaState::AllocatePrimary.is_wait_state());
    }

    #[test]
    fn new_operation_starts_in_validate() {
        let spec = FlowSpec {
            source: FlowEndpoint::new("sw1", 1),
            destination: FlowEndpoint::new("sw2", 1),
            bandwidth: 100,
            ignore_bandwidth: false,
            protected_path: true,
        };
        let op = FlowOperation::new(FlowId::new("f1"), &RequestPayload::Create(spec));
        assert_eq!(op.state, SagaState::Validate);
        assert_eq!(op.kind, OperationKind::Create);
        assert_eq!(op.result, OperationResult::Pending);
        assert!(op.wants_protected());
    }

    #[test]
    fn payload_kind_mapping() {
        assert_eq!(RequestPayload::Delete.kind(), OperationKind::Delete);
        assert_eq!(
            RequestPayload::Reroute {
                force_recreate: true
            }
            .kind(),
            OperationKind::Reroute
        );
    }
}
