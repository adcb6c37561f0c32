//! The explicit saga transition table.
//!
//! Each `(kind, state, event)` triple maps to exactly one `(action, next
//! state)` pair or to `None`, in which case the caller logs the event and
//! ignores it. The table is a pure function so invariants can be checked
//! by driving it with synthetic event sequences, and
//! [`validate_table`] asserts the structural properties every kind must
//! satisfy.

use super::{Event, OperationKind, SagaState};

/// The action executed on entry to the transition's target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Validate the request against current flow state.
    RunValidate,
    /// Resolve and reserve the primary path.
    RunAllocatePrimary,
    /// Resolve and reserve the protected path.
    RunAllocateProtected,
    /// Dispatch transit/egress install commands.
    DispatchNonIngress,
    /// Dispatch ingress install and meter commands.
    DispatchIngress,
    /// Dispatch verification commands.
    DispatchVerify,
    /// Dispatch removal commands.
    DispatchRemove,
    /// Feed a speaker response into the active step.
    HandleResponse,
    /// Feed a synthesized timeout into the active step.
    HandleTimeout,
    /// Record the failure cause before compensation.
    RecordFailure,
    /// Release grants and remove installed rules.
    RunRollback,
    /// Commit the operation and report success.
    FinishSuccess,
    /// Finalize the failure result.
    FinishReverted,
}

/// Looks up the transition for an event in a state.
///
/// `protected` selects whether allocation continues into the protected
/// path micro-state.
#[must_use]
pub fn next(
    kind: OperationKind,
    protected: bool,
    state: SagaState,
    event: &Event,
) -> Option<(Action, SagaState)> {
    use Action as A;
    use SagaState as S;

    // Failure path is shared by every kind and reachable from any
    // non-terminal state except the compensation states themselves.
    if let Event::StepFailed(_) = event {
        return match state {
            S::Complete | S::Reverted | S::Failed | S::Rollback => None,
            _ => Some((A::RecordFailure, S::Failed)),
        };
    }

    // Response/timeout routing while parked in a wait state.
    if state.is_wait_state() {
        match event {
            Event::Response(_) => return Some((A::HandleResponse, state)),
            Event::Timeout(_) => return Some((A::HandleTimeout, state)),
            _ => {}
        }
    }

    match (state, event) {
        (S::Validate, Event::Start) => Some((A::RunValidate, S::Validate)),

        (S::Validate, Event::StepCompleted) => match kind {
            OperationKind::Create | OperationKind::Reroute => {
                Some((A::RunAllocatePrimary, S::AllocatePrimary))
            }
            OperationKind::Delete => Some((A::DispatchRemove, S::RemoveRules)),
        },

        (S::AllocatePrimary, Event::StepCompleted) => {
            if protected {
                Some((A::RunAllocateProtected, S::AllocateProtected))
            } else {
                Some((A::DispatchNonIngress, S::InstallNonIngress))
            }
        }
        // "Same path found" is a valid terminal micro-state for reroute:
        // no resource churn, straight to completion.
        (S::AllocatePrimary, Event::SamePathFound) if kind == OperationKind::Reroute => {
            Some((A::FinishSuccess, S::Complete))
        }

        (S::AllocateProtected, Event::StepCompleted) => {
            Some((A::DispatchNonIngress, S::InstallNonIngress))
        }

        (S::InstallNonIngress, Event::StepCompleted) => {
            Some((A::DispatchIngress, S::InstallIngress))
        }

        (S::InstallIngress, Event::StepCompleted) => Some((A::DispatchVerify, S::ValidateRules)),

        (S::ValidateRules, Event::StepCompleted) => match kind {
            OperationKind::Create => Some((A::FinishSuccess, S::Complete)),
            // Reroute still has to retire the old path's rules.
            OperationKind::Reroute => Some((A::DispatchRemove, S::RemoveRules)),
            OperationKind::Delete => None,
        },

        (S::RemoveRules, Event::StepCompleted) => Some((A::FinishSuccess, S::Complete)),

        (S::Failed, Event::Next) => Some((A::RunRollback, S::Rollback)),
        (S::Rollback, Event::RollbackDone) => Some((A::FinishReverted, S::Reverted)),

        _ => None,
    }
}

/// Structural validation of the transition table.
///
/// Checked at service startup and in tests:
///
/// - every non-terminal state routes `StepFailed` to the failure path
/// - terminal states absorb every event
/// - every kind has a route from `Validate` to `Complete`
///
/// # Errors
///
/// Returns a description of the first violated property.
pub fn validate_table() -> Result<(), String> {
    let all_states = [
        SagaState::Validate,
        SagaState::AllocatePrimary,
        SagaState::AllocateProtected,
        SagaState::InstallNonIngress,
        SagaState::InstallIngress,
        SagaState::ValidateRules,
        SagaState::RemoveRules,
        SagaState::Complete,
        SagaState::Failed,
        SagaState::Rollback,
        SagaState::Reverted,
    ];
    let kinds = [
        OperationKind::Create,
        OperationKind::Delete,
        OperationKind::Reroute,
    ];
    let probe_events = [
        Event::Start,
        Event::Next,
        Event::StepCompleted,
        Event::SamePathFound,
        Event::RollbackDone,
    ];

    for kind in kinds {
        for protected in [false, true] {
            for state in all_states {
                let failed = Event::StepFailed(super::FailureCause {
                    error_type: "INTERNAL_ERROR".into(),
                    message: "probe".into(),
                });
                let routed = next(kind, protected, state, &failed);
                match state {
                    SagaState::Complete
                    | SagaState::Reverted
                    | SagaState::Failed
                    | SagaState::Rollback => {
                        if routed.is_some() {
                            return Err(format!(
                                "{kind}: {state} must not route StepFailed"
                            ));
                        }
                    }
                    _ => {
                        if routed != Some((Action::RecordFailure, SagaState::Failed)) {
                            return Err(format!(
                                "{kind}: {state} must route StepFailed to FAILED"
                            ));
                        }
                    }
                }

                if state.is_terminal() {
                    for event in &probe_events {
                        if next(kind, protected, state, event).is_some() {
                            return Err(format!(
                                "{kind}: terminal {state} must absorb {}",
                                event.label()
                            ));
                        }
                    }
                }
            }

            // Drive the happy path to completion.
            let mut state = SagaState::Validate;
            let mut hops = 0;
            let mut event = Event::Start;
            while !state.is_terminal() {
                let Some((_, to)) = next(kind, protected, state, &event) else {
                    return Err(format!(
                        "{kind} (protected={protected}): no route from {state} on {}",
                        event.label()
                    ));
                };
                state = to;
                event = Event::StepCompleted;
                hops += 1;
                if hops > 16 {
                    return Err(format!("{kind}: happy path does not terminate"));
                }
            }
            if state != SagaState::Complete {
                return Err(format!("{kind}: happy path ends in {state}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::FailureCause;

    fn failed() -> Event {
        Event::StepFailed(FailureCause {
            error_type: "RESOURCE_ALLOCATION_ERROR".into(),
            message: "segment full".into(),
        })
    }

    #[test]
    fn table_is_structurally_valid() {
        validate_table().expect("transition table invariants");
    }

    #[test]
    fn create_happy_path() {
        use OperationKind::Create;
        let mut state = SagaState::Validate;
        let expected = [
            SagaState::Validate,
            SagaState::AllocatePrimary,
            SagaState::InstallNonIngress,
            SagaState::InstallIngress,
            SagaState::ValidateRules,
            SagaState::Complete,
        ];
        let mut visited = vec![];
        let mut event = Event::Start;
        while !state.is_terminal() {
            let (_, to) = next(Create, false, state, &event).unwrap();
            visited.push(to);
            state = to;
            event = Event::StepCompleted;
        }
        assert_eq!(visited, expected[..]);
    }

    #[test]
    fn protected_create_visits_protected_allocation() {
        use OperationKind::Create;
        let (_, to) = next(Create, true, SagaState::AllocatePrimary, &Event::StepCompleted)
            .unwrap();
        assert_eq!(to, SagaState::AllocateProtected);
    }

    #[test]
    fn delete_skips_allocation() {
        use OperationKind::Delete;
        let (action, to) = next(Delete, false, SagaState::Validate, &Event::StepCompleted).unwrap();
        assert_eq!(action, Action::DispatchRemove);
        assert_eq!(to, SagaState::RemoveRules);
    }

    #[test]
    fn reroute_same_path_short_circuits() {
        use OperationKind::Reroute;
        let (action, to) =
            next(Reroute, false, SagaState::AllocatePrimary, &Event::SamePathFound).unwrap();
        assert_eq!(action, Action::FinishSuccess);
        assert_eq!(to, SagaState::Complete);

        // Create never takes that route.
        assert!(
            next(
                OperationKind::Create,
                false,
                SagaState::AllocatePrimary,
                &Event::SamePathFound
            )
            .is_none()
        );
    }

    #[test]
    fn reroute_removes_old_rules_after_verification() {
        use OperationKind::Reroute;
        let (action, to) =
            next(Reroute, false, SagaState::ValidateRules, &Event::StepCompleted).unwrap();
        assert_eq!(action, Action::DispatchRemove);
        assert_eq!(to, SagaState::RemoveRules);
    }

    #[test]
    fn any_step_failure_routes_to_failed() {
        for state in [
            SagaState::Validate,
            SagaState::AllocatePrimary,
            SagaState::InstallIngress,
            SagaState::RemoveRules,
        ] {
            let (action, to) = next(OperationKind::Create, false, state, &failed()).unwrap();
            assert_eq!(action, Action::RecordFailure);
            assert_eq!(to, SagaState::Failed);
        }
    }

    #[test]
    fn unmodeled_events_are_not_routed() {
        assert!(next(
            OperationKind::Create,
            false,
            SagaState::Validate,
            &Event::RollbackDone
        )
        .is_none());
        assert!(next(
            OperationKind::Delete,
            false,
            SagaState::Complete,
            &Event::StepCompleted
        )
        .is_none());
    }

    #[test]
    fn responses_only_route_in_wait_states() {
        use crate::dispatch::{ResponseOutcome, SpeakerResponse};
        use trellis_core::{CommandId, FlowId, OperationId, SwitchId};

        let response = Event::Response(SpeakerResponse {
            command_id: CommandId::generate(),
            operation_id: OperationId::generate(),
            flow_id: FlowId::new("f1"),
            switch_id: SwitchId::new("sw1"),
            outcome: ResponseOutcome::Success,
        });

        assert!(next(
            OperationKind::Create,
            false,
            SagaState::InstallIngress,
            &response
        )
        .is_some());
        assert!(next(OperationKind::Create, false, SagaState::Validate, &response).is_none());
    }
}
