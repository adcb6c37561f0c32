//! Executes saga actions against the ledger, resolver, store, and
//! switch-agents.
//!
//! [`Orchestrator::advance`] is the single entry point: it feeds one
//! external event into an operation's FSM and drains the resulting chain
//! of internal events until the saga parks in a wait state or reaches a
//! terminal state. All mutation of a [`FlowOperation`] happens here, on
//! the worker task that owns the flow's partition.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;

use trellis_core::Cookie;

use crate::config::FlowServiceConfig;
use crate::correlation::{CorrelationKey, CorrelationRouter};
use crate::dispatch::{
    CommandKind, ResponseOutcome, SpeakerCommand, SpeakerErrorCode, SpeakerResponse, StepOutcome,
    StepProgress, StepTracker, SwitchAgent,
};
use crate::error::Error;
use crate::history::HistoryRecorder;
use crate::ledger::{self, ResourceLedger};
use crate::model::{Flow, FlowStatus, ResourceGrant};
use crate::resolver::{PathConstraints, PathResolver, PathStrategy, ResolvedPath};
use crate::store::{FlowStore, TransactionRunner};

use super::transitions::{self, Action};
use super::{Event, FailureCause, FlowOperation, OperationKind, OperationResult, SagaState};

/// Strategy preference order used for every path computation.
const STRATEGIES: [PathStrategy; 2] = [PathStrategy::Cost, PathStrategy::MaxBandwidth];

/// Drives flow operations through their saga.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn FlowStore>,
    ledger: ResourceLedger,
    resolver: Arc<dyn PathResolver>,
    agent: Arc<dyn SwitchAgent>,
    history: HistoryRecorder,
    txn: TransactionRunner,
    config: FlowServiceConfig,
}

impl Orchestrator {
    /// Creates an orchestrator over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn FlowStore>,
        ledger: ResourceLedger,
        resolver: Arc<dyn PathResolver>,
        agent: Arc<dyn SwitchAgent>,
        history: HistoryRecorder,
        txn: TransactionRunner,
        config: FlowServiceConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            resolver,
            agent,
            history,
            txn,
            config,
        }
    }

    /// Feeds one event into the operation and drains the internal event
    /// chain until the saga parks or terminates.
    ///
    /// Unmodeled `(state, event)` pairs are logged and dropped; failures
    /// inside an action are converted into `StepFailed` events so the
    /// compensation path runs like any other transition.
    pub async fn advance(
        &self,
        op: &mut FlowOperation,
        router: &mut CorrelationRouter,
        event: Event,
    ) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            if op.is_terminal() {
                tracing::debug!(
                    operation_id = %op.operation_id,
                    flow_id = %op.flow_id,
                    state = %op.state,
                    event = event.label(),
                    "event dropped in terminal state"
                );
                break;
            }

            let Some((action, next_state)) =
                transitions::next(op.kind, op.wants_protected(), op.state, &event)
            else {
                tracing::debug!(
                    operation_id = %op.operation_id,
                    flow_id = %op.flow_id,
                    state = %op.state,
                    event = event.label(),
                    "unmodeled event ignored"
                );
                continue;
            };

            let from = op.state;
            op.state = next_state;
            tracing::debug!(
                operation_id = %op.operation_id,
                flow_id = %op.flow_id,
                kind = %op.kind,
                from = %from,
                to = %next_state,
                event = event.label(),
                action = ?action,
                "saga transition"
            );

            if let Some(follow_up) = self.execute(op, router, action, &event).await {
                queue.push_back(follow_up);
            }
        }
    }

    async fn execute(
        &self,
        op: &mut FlowOperation,
        router: &mut CorrelationRouter,
        action: Action,
        event: &Event,
    ) -> Option<Event> {
        match action {
            Action::RunValidate => self.run_validate(op).await,
            Action::RunAllocatePrimary => self.run_allocate_primary(op).await,
            Action::RunAllocateProtected => self.run_allocate_protected(op).await,
            Action::DispatchNonIngress => {
                let commands = self.build_non_ingress(op);
                self.dispatch(op, router, "install_non_ingress", commands)
                    .await
            }
            Action::DispatchIngress => {
                let commands = self.build_ingress(op);
                self.dispatch(op, router, "install_ingress", commands).await
            }
            Action::DispatchVerify => {
                let commands = self.build_verify(op);
                self.dispatch(op, router, "validate_rules", commands).await
            }
            Action::DispatchRemove => {
                let commands = self.build_remove(op);
                self.dispatch(op, router, "remove_rules", commands).await
            }
            Action::HandleResponse => {
                let Event::Response(response) = event else {
                    return None;
                };
                self.handle_response(op, router, response).await
            }
            Action::HandleTimeout => {
                let Event::Timeout(command_id) = event else {
                    return None;
                };
                self.handle_timeout(op, router, *command_id).await
            }
            Action::RecordFailure => {
                let Event::StepFailed(cause) = event else {
                    return None;
                };
                self.record_failure(op, cause.clone())
            }
            Action::RunRollback => Some(self.run_rollback(op).await),
            Action::FinishSuccess => {
                self.finish_success(op).await;
                None
            }
            Action::FinishReverted => {
                self.finish_reverted(op);
                None
            }
        }
    }

    // --- Validation ---

    async fn run_validate(&self, op: &mut FlowOperation) -> Option<Event> {
        let outcome = match op.kind {
            OperationKind::Create => self.validate_create(op).await,
            OperationKind::Delete | OperationKind::Reroute => self.validate_existing(op).await,
        };
        Some(match outcome {
            Ok(()) => Event::StepCompleted,
            Err(err) => Event::StepFailed(FailureCause::from_error(&err)),
        })
    }

    async fn validate_create(&self, op: &mut FlowOperation) -> crate::error::Result<()> {
        let Some(spec) = op.spec.clone() else {
            return Err(Error::internal("create operation without a spec"));
        };
        if spec.source == spec.destination {
            return Err(Error::validation(
                "source and destination endpoints are identical",
            ));
        }
        if self.store.find_flow(&op.flow_id).await?.is_some() {
            return Err(Error::validation(format!(
                "flow {} already exists",
                op.flow_id
            )));
        }

        let flow = Flow::from_spec(op.flow_id.clone(), &spec);
        self.store.save_flow(&flow).await?;
        op.flow = Some(flow);
        self.history.record(
            &op.flow_id,
            "operation_created",
            format!("{} operation admitted", op.kind),
            None,
        );
        Ok(())
    }

    async fn validate_existing(&self, op: &mut FlowOperation) -> crate::error::Result<()> {
        let mut flow = self
            .store
            .find_flow(&op.flow_id)
            .await?
            .ok_or_else(|| Error::not_found("flow", &op.flow_id))?;

        op.old_grants = ledger::current_grants(self.store.as_ref(), &op.flow_id).await?;

        flow.status = FlowStatus::InProgress;
        self.store.save_flow(&flow).await?;
        op.flow = Some(flow);
        self.history.record(
            &op.flow_id,
            "operation_created",
            format!("{} operation admitted", op.kind),
            None,
        );
        Ok(())
    }

    // --- Allocation ---

    /// The grant backing the flow's committed primary paths, if any.
    fn old_primary(op: &FlowOperation) -> Option<&ResourceGrant> {
        let cookie = op.flow.as_ref()?.cookie?;
        op.old_grants.iter().find(|g| g.cookie == cookie)
    }

    fn old_protected(op: &FlowOperation) -> Option<&ResourceGrant> {
        let cookie = op.flow.as_ref()?.cookie?;
        op.old_grants.iter().find(|g| g.cookie != cookie)
    }

    /// Asks the path engine for a candidate, retrying transient faults
    /// within the same budget the ledger uses for its transactions.
    async fn resolve_with_retry(
        &self,
        flow: &Flow,
        constraints: &PathConstraints,
    ) -> crate::error::Result<ResolvedPath> {
        self.txn
            .run("saga.resolve", || async {
                self.resolver
                    .resolve(flow, constraints, &STRATEGIES)
                    .await
                    .map_err(Error::from)
            })
            .await
    }

    async fn run_allocate_primary(&self, op: &mut FlowOperation) -> Option<Event> {
        let Some(flow) = op.flow.clone() else {
            return Some(Event::StepFailed(FailureCause::from_error(
                &Error::internal("allocation without a loaded flow"),
            )));
        };

        let constraints = PathConstraints {
            reuse: op.old_grants.iter().map(|g| g.paths.clone()).collect(),
            avoid: Vec::new(),
        };
        let resolved = match self.resolve_with_retry(&flow, &constraints).await {
            Ok(resolved) => resolved,
            Err(err) => {
                return Some(Event::StepFailed(FailureCause::from_error(&err)));
            }
        };

        // A reroute that resolves to the committed path has nothing to do
        // unless the caller forces recreation.
        if op.kind == OperationKind::Reroute
            && !op.force_recreate
            && flow.paths.as_ref() == Some(&resolved.paths)
        {
            op.same_path = true;
            self.history.record(
                &op.flow_id,
                "reroute_skipped",
                "resolved path equals the installed path",
                None,
            );
            return Some(Event::SamePathFound);
        }

        let replaces = Self::old_primary(op).cloned();
        match self
            .ledger
            .allocate(&flow, &resolved.paths, replaces.as_ref())
            .await
        {
            Ok(grant) => {
                self.history.record(
                    &op.flow_id,
                    "path_allocated",
                    format!("primary path reserved via {}", resolved.strategy),
                    serde_json::to_value(&grant.paths).ok(),
                );
                op.new_primary = Some(grant);
                Some(Event::StepCompleted)
            }
            Err(err) => Some(Event::StepFailed(FailureCause::from_error(&err))),
        }
    }

    async fn run_allocate_protected(&self, op: &mut FlowOperation) -> Option<Event> {
        let (Some(flow), Some(primary)) = (op.flow.clone(), op.new_primary.clone()) else {
            return Some(Event::StepFailed(FailureCause::from_error(
                &Error::internal("protected allocation before primary"),
            )));
        };

        // Diversity constraint: the protected path must avoid the primary's
        // segments.
        let constraints = PathConstraints {
            reuse: op.old_grants.iter().map(|g| g.paths.clone()).collect(),
            avoid: vec![primary.paths],
        };
        let resolved = match self.resolve_with_retry(&flow, &constraints).await {
            Ok(resolved) => resolved,
            Err(err) => {
                return Some(Event::StepFailed(FailureCause::from_error(&err)));
            }
        };

        let replaces = Self::old_protected(op).cloned();
        match self
            .ledger
            .allocate(&flow, &resolved.paths, replaces.as_ref())
            .await
        {
            Ok(grant) => {
                self.history.record(
                    &op.flow_id,
                    "protected_path_allocated",
                    format!("protected path reserved via {}", resolved.strategy),
                    serde_json::to_value(&grant.paths).ok(),
                );
                op.new_protected = Some(grant);
                Some(Event::StepCompleted)
            }
            Err(err) => Some(Event::StepFailed(FailureCause::from_error(&err))),
        }
    }

    // --- Command building ---

    fn build_non_ingress(&self, op: &FlowOperation) -> Vec<SpeakerCommand> {
        let Some(flow) = op.flow.as_ref() else {
            return Vec::new();
        };
        let mut commands = Vec::new();
        if let Some(grant) = op.new_primary.as_ref() {
            commands.extend(super::commands::install_non_ingress(
                op.operation_id,
                flow,
                grant,
            ));
        }
        if let Some(grant) = op.new_protected.as_ref() {
            commands.extend(super::commands::install_non_ingress(
                op.operation_id,
                flow,
                grant,
            ));
        }
        commands
    }

    fn build_ingress(&self, op: &FlowOperation) -> Vec<SpeakerCommand> {
        let (Some(flow), Some(grant)) = (op.flow.as_ref(), op.new_primary.as_ref()) else {
            return Vec::new();
        };
        // Protected paths stand by without ingress rules; only the primary
        // forwards traffic.
        super::commands::install_ingress(op.operation_id, flow, grant)
    }

    fn build_verify(&self, op: &mut FlowOperation) -> Vec<SpeakerCommand> {
        op.installed.sort();
        op.installed.dedup();
        super::commands::verify_installed(op.operation_id, &op.flow_id, &op.installed)
    }

    fn build_remove(&self, op: &FlowOperation) -> Vec<SpeakerCommand> {
        let Some(flow) = op.flow.as_ref() else {
            return Vec::new();
        };
        op.old_grants
            .iter()
            .flat_map(|grant| super::commands::remove_grant(op.operation_id, flow, grant))
            .collect()
    }

    // --- Dispatch and response handling ---

    /// Issues a step's commands and parks the saga awaiting responses.
    ///
    /// An empty command set completes the step immediately (single-switch
    /// flows produce no non-ingress rules, for example). A failed send is
    /// logged and left to the timeout ladder, which retries with the same
    /// command id.
    async fn dispatch(
        &self,
        op: &mut FlowOperation,
        router: &mut CorrelationRouter,
        step: &'static str,
        commands: Vec<SpeakerCommand>,
    ) -> Option<Event> {
        if commands.is_empty() {
            tracing::debug!(
                operation_id = %op.operation_id,
                flow_id = %op.flow_id,
                step,
                "step has no commands, completing immediately"
            );
            return Some(Event::StepCompleted);
        }

        tracing::info!(
            operation_id = %op.operation_id,
            flow_id = %op.flow_id,
            step,
            commands = commands.len(),
            "dispatching step"
        );

        let deadline = Utc::now() + self.config.command_timeout();
        op.step = Some(StepTracker::new(
            commands.clone(),
            self.config.command_retry_limit,
        ));

        for command in commands {
            let key = CorrelationKey::new(command.command_id, op.operation_id);
            if let Err(err) = router.register(key, deadline) {
                tracing::warn!(key = %key, error = %err, "correlation slot already open");
                continue;
            }
            self.send(command).await;
        }
        None
    }

    async fn send(&self, command: SpeakerCommand) {
        let command_id = command.command_id;
        let switch_id = command.switch_id.clone();
        if let Err(err) = self.agent.send(command).await {
            // No response will arrive; the deadline converts this into a
            // timeout and the retry ladder takes over.
            tracing::warn!(
                command_id = %command_id,
                switch_id = %switch_id,
                error = %err,
                "failed to send command, awaiting timeout"
            );
        }
    }

    async fn handle_response(
        &self,
        op: &mut FlowOperation,
        router: &mut CorrelationRouter,
        response: &SpeakerResponse,
    ) -> Option<Event> {
        // Capture what the response confirms before the tracker forgets
        // the command: successful installs are what rollback must undo and
        // verification must check.
        if matches!(response.outcome, ResponseOutcome::Success) {
            if let Some(command) = op
                .step
                .as_ref()
                .and_then(|step| step.pending_command(response.command_id))
            {
                if let Some(cookie) = install_cookie(&command.kind) {
                    op.installed.push((command.switch_id.clone(), cookie));
                }
            }
        }

        // An unsupported feature is skipped, not failed; leave an audit
        // trace so operators can see which switch lacks it.
        if let ResponseOutcome::Error {
            code: SpeakerErrorCode::UnsupportedOperation,
            description,
        } = &response.outcome
        {
            let skipped = Error::UnsupportedOnSwitch {
                switch_id: response.switch_id.clone(),
                message: description.clone(),
            };
            self.history
                .record(&op.flow_id, "command_skipped", skipped.to_string(), None);
        }

        let Some(step) = op.step.as_mut() else {
            tracing::debug!(
                operation_id = %op.operation_id,
                command_id = %response.command_id,
                "response without an active step, dropped"
            );
            return None;
        };
        let progress = step.on_response(response);
        self.apply_progress(op, router, progress).await
    }

    async fn handle_timeout(
        &self,
        op: &mut FlowOperation,
        router: &mut CorrelationRouter,
        command_id: trellis_core::CommandId,
    ) -> Option<Event> {
        let Some(step) = op.step.as_mut() else {
            tracing::debug!(
                operation_id = %op.operation_id,
                command_id = %command_id,
                "timeout without an active step, dropped"
            );
            return None;
        };
        tracing::warn!(
            operation_id = %op.operation_id,
            flow_id = %op.flow_id,
            command_id = %command_id,
            "command deadline expired"
        );
        let progress = step.on_timeout(command_id);
        self.apply_progress(op, router, progress).await
    }

    async fn apply_progress(
        &self,
        op: &mut FlowOperation,
        router: &mut CorrelationRouter,
        progress: StepProgress,
    ) -> Option<Event> {
        match progress {
            StepProgress::Pending | StepProgress::Ignored => None,
            StepProgress::Resend(command) => {
                let deadline = Utc::now() + self.config.command_timeout();
                let key = CorrelationKey::new(command.command_id, op.operation_id);
                // The original registration was consumed by the response or
                // the timeout scan, so re-registering cannot collide.
                if let Err(err) = router.register(key, deadline) {
                    tracing::warn!(key = %key, error = %err, "resend registration failed");
                    return None;
                }
                tracing::info!(
                    operation_id = %op.operation_id,
                    command_id = %command.command_id,
                    switch_id = %command.switch_id,
                    attempt = command.attempt,
                    "retrying command"
                );
                self.send(command).await;
                None
            }
            StepProgress::Complete(StepOutcome::Success) => {
                op.step = None;
                Some(Event::StepCompleted)
            }
            StepProgress::Complete(StepOutcome::Failed { failed, timed_out }) => {
                op.step = None;
                // A step lost purely to silent switches reads differently to
                // the caller than one a switch rejected.
                let err = match timed_out.first() {
                    Some(command_id) if timed_out.len() == failed.len() => Error::Timeout {
                        command_id: *command_id,
                    },
                    _ => Error::CommandsFailed {
                        step: "switch command step",
                        count: failed.len(),
                    },
                };
                Some(Event::StepFailed(FailureCause::from_error(&err)))
            }
        }
    }

    // --- Failure and compensation ---

    fn record_failure(&self, op: &mut FlowOperation, cause: FailureCause) -> Option<Event> {
        tracing::warn!(
            operation_id = %op.operation_id,
            flow_id = %op.flow_id,
            kind = %op.kind,
            error_type = %cause.error_type,
            message = %cause.message,
            "operation failed, starting rollback"
        );
        self.history.record(
            &op.flow_id,
            "operation_failed",
            cause.message.clone(),
            None,
        );
        op.failure = Some(cause);
        op.step = None;
        Some(Event::Next)
    }

    /// Compensates everything the operation did: removes installed rules
    /// (single attempt, best effort), releases reserved grants, and puts
    /// the flow record back into a consistent state.
    async fn run_rollback(&self, op: &mut FlowOperation) -> Event {
        op.installed.sort();
        op.installed.dedup();
        tracing::info!(
            operation_id = %op.operation_id,
            flow_id = %op.flow_id,
            grants = op.allocated_resources().len(),
            rules = op.installed.len(),
            "compensating operation"
        );
        for (switch_id, cookie) in op.installed.clone() {
            let command = SpeakerCommand {
                command_id: trellis_core::CommandId::generate(),
                operation_id: op.operation_id,
                flow_id: op.flow_id.clone(),
                switch_id,
                kind: CommandKind::RemoveRule { cookie },
                attempt: 0,
            };
            self.send(command).await;
        }

        for grant in [op.new_primary.take(), op.new_protected.take()]
            .into_iter()
            .flatten()
        {
            if let Err(err) = self.ledger.release(&grant).await {
                tracing::error!(
                    flow_id = %op.flow_id,
                    cookie = %grant.cookie,
                    error = %err,
                    "failed to release grant during rollback"
                );
            }
            op.rejected.push(grant);
        }

        let restore = match op.kind {
            // Only remove the record this operation created; a create that
            // failed validation never saved one (and must not touch a
            // pre-existing flow with the same id).
            OperationKind::Create => match op.flow.take() {
                Some(_) => self.store.remove_flow(&op.flow_id).await,
                None => Ok(()),
            },
            OperationKind::Delete | OperationKind::Reroute => match op.flow.as_mut() {
                Some(flow) => {
                    flow.status = FlowStatus::Down;
                    self.store.save_flow(flow).await
                }
                None => Ok(()),
            },
        };
        if let Err(err) = restore {
            tracing::error!(
                flow_id = %op.flow_id,
                error = %err,
                "failed to restore flow record during rollback"
            );
        }

        self.history.record(
            &op.flow_id,
            "operation_rolled_back",
            format!("{} operation compensated", op.kind),
            None,
        );
        Event::RollbackDone
    }

    // --- Terminal states ---

    async fn finish_success(&self, op: &mut FlowOperation) {
        let commit = self.commit(op).await;
        if let Err(err) = commit {
            tracing::error!(
                operation_id = %op.operation_id,
                flow_id = %op.flow_id,
                error = %err,
                "commit failed after successful installation"
            );
            op.result = OperationResult::Error(FailureCause::from_error(&err));
            return;
        }
        op.result = OperationResult::Success;
        self.history.record(
            &op.flow_id,
            "operation_completed",
            format!("{} operation completed", op.kind),
            None,
        );
        tracing::info!(
            operation_id = %op.operation_id,
            flow_id = %op.flow_id,
            kind = %op.kind,
            "operation completed"
        );
    }

    async fn commit(&self, op: &mut FlowOperation) -> crate::error::Result<()> {
        match op.kind {
            OperationKind::Delete => {
                for grant in op.old_grants.drain(..) {
                    self.ledger.release(&grant).await?;
                }
                self.store.remove_flow(&op.flow_id).await
            }
            OperationKind::Create | OperationKind::Reroute => {
                let Some(mut flow) = op.flow.take() else {
                    return Err(Error::internal("commit without a loaded flow"));
                };
                if op.same_path {
                    flow.status = FlowStatus::Up;
                    self.store.save_flow(&flow).await?;
                    op.flow = Some(flow);
                    return Ok(());
                }
                if op.kind == OperationKind::Reroute {
                    for grant in op.old_grants.drain(..) {
                        self.ledger.release(&grant).await?;
                    }
                }
                if let Some(primary) = op.new_primary.as_ref() {
                    flow.paths = Some(primary.paths.clone());
                    flow.cookie = Some(primary.cookie);
                }
                flow.protected_paths = op.new_protected.as_ref().map(|g| g.paths.clone());
                flow.status = FlowStatus::Up;
                self.store.save_flow(&flow).await?;
                op.flow = Some(flow);
                Ok(())
            }
        }
    }

    fn finish_reverted(&self, op: &mut FlowOperation) {
        let cause = op.failure.clone().unwrap_or_else(|| {
            FailureCause::from_error(&Error::internal("reverted without a recorded cause"))
        });
        tracing::warn!(
            operation_id = %op.operation_id,
            flow_id = %op.flow_id,
            kind = %op.kind,
            error_type = %cause.error_type,
            released_grants = op.rejected_resources().len(),
            "operation reverted"
        );
        op.result = OperationResult::Error(cause);
        debug_assert_eq!(op.state, SagaState::Reverted);
    }
}

/// Cookie carried by an install command, if it installs a rule.
const fn install_cookie(kind: &CommandKind) -> Option<Cookie> {
    match kind {
        CommandKind::InstallIngress { cookie, .. }
        | CommandKind::InstallTransit { cookie, .. }
        | CommandKind::InstallEgress { cookie, .. } => Some(*cookie),
        _ => None,
    }
}
