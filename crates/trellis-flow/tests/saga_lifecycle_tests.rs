//! End-to-end lifecycle tests: full sagas driven through the service
//! against in-memory collaborators.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    create_request, delete_request, direct_pair, fast_config, reroute_request, start_harness,
    total_used, ScriptedAgent, LINK_CAPACITY, PRIMARY_PORT, PROTECTED_PORT,
};
use trellis_core::FlowId;
use trellis_flow::dispatch::{CommandKind, ResponseOutcome, SpeakerErrorCode};
use trellis_flow::model::{FlowEndpoint, FlowSpec, FlowStatus};
use trellis_flow::resolver::ResolveError;
use trellis_flow::saga::RequestPayload;
use trellis_flow::store::FlowStore;
use trellis_flow::FlowRequest;

fn busy(description: &str) -> ResponseOutcome {
    ResponseOutcome::Error {
        code: SpeakerErrorCode::SwitchBusy,
        description: description.to_string(),
    }
}

#[tokio::test]
async fn create_provisions_flow_end_to_end() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;

    let response = h
        .service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    assert!(response.is_success(), "unexpected error: {response:?}");

    let flow = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .expect("flow persisted");
    assert_eq!(flow.status, FlowStatus::Up);
    assert_eq!(flow.paths, Some(direct_pair(PRIMARY_PORT)));
    assert!(flow.cookie.is_some());
    assert_eq!(h.store.grant_count().unwrap(), 1);

    // Both directions of the direct link carry the reservation.
    assert_eq!(total_used(&h.store), 600);

    let sent = h.agent.sent();
    let ingress = sent
        .iter()
        .filter(|c| matches!(c.kind, CommandKind::InstallIngress { .. }))
        .count();
    let meters = sent
        .iter()
        .filter(|c| matches!(c.kind, CommandKind::InstallMeter { .. }))
        .count();
    let verifies = sent
        .iter()
        .filter(|c| matches!(c.kind, CommandKind::VerifyRule { .. }))
        .count();
    assert_eq!(ingress, 2);
    assert_eq!(meters, 2);
    // Rules share the flow's cookie, so verification is per switch.
    assert_eq!(verifies, 2);

    let actions: Vec<String> = h
        .history
        .entries_for(&FlowId::new("f1"))
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&"operation_created".to_string()));
    assert!(actions.contains(&"path_allocated".to_string()));
    assert!(actions.contains(&"operation_completed".to_string()));
}

#[tokio::test]
async fn duplicate_create_is_rejected_and_flow_survives() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;

    let first = h
        .service
        .submit(create_request("f1", 100, false))
        .await
        .unwrap();
    assert!(first.is_success());

    let second = h
        .service
        .submit(create_request("f1", 100, false))
        .await
        .unwrap();
    assert_eq!(second.error_type.as_deref(), Some("VALIDATION_ERROR"));

    // The original flow and its resources are untouched.
    let flow = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .expect("original flow intact");
    assert_eq!(flow.status, FlowStatus::Up);
    assert_eq!(h.store.grant_count().unwrap(), 1);
}

#[tokio::test]
async fn identical_endpoints_fail_validation() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;

    let response = h
        .service
        .submit(FlowRequest {
            flow_id: FlowId::new("loop"),
            payload: RequestPayload::Create(FlowSpec {
                source: FlowEndpoint::new("sw-a", 1),
                destination: FlowEndpoint::new("sw-a", 1),
                bandwidth: 0,
                ignore_bandwidth: false,
                protected_path: false,
            }),
        })
        .await
        .unwrap();
    assert_eq!(response.error_type.as_deref(), Some("VALIDATION_ERROR"));
    assert!(h.store.find_flow(&FlowId::new("loop")).await.unwrap().is_none());
}

#[tokio::test]
async fn protected_create_allocates_diverse_path() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;

    let response = h
        .service
        .submit(create_request("f1", 200, true))
        .await
        .unwrap();
    assert!(response.is_success(), "unexpected error: {response:?}");

    let flow = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flow.paths, Some(direct_pair(PRIMARY_PORT)));
    assert_eq!(flow.protected_paths, Some(direct_pair(PROTECTED_PORT)));
    assert_eq!(h.store.grant_count().unwrap(), 2);

    // 200 kbps on both directions of both links.
    assert_eq!(total_used(&h.store), 800);
}

#[tokio::test]
async fn delete_releases_everything() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;
    h.service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();

    let response = h.service.submit(delete_request("f1")).await.unwrap();
    assert!(response.is_success());

    assert!(h.store.find_flow(&FlowId::new("f1")).await.unwrap().is_none());
    assert_eq!(h.store.grant_count().unwrap(), 0);
    assert_eq!(total_used(&h.store), 0);

    let sent = h.agent.sent();
    let rule_removes = sent
        .iter()
        .filter(|c| matches!(c.kind, CommandKind::RemoveRule { .. }))
        .count();
    let meter_removes = sent
        .iter()
        .filter(|c| matches!(c.kind, CommandKind::RemoveMeter { .. }))
        .count();
    assert_eq!(rule_removes, 2, "one removal per switch of the path");
    assert_eq!(meter_removes, 2, "both ingress meters removed");
}

#[tokio::test]
async fn delete_of_unknown_flow_is_not_found() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;
    let response = h.service.submit(delete_request("ghost")).await.unwrap();
    assert_eq!(response.error_type.as_deref(), Some("NOT_FOUND"));
}

#[tokio::test]
async fn reroute_onto_same_path_is_a_no_op() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;
    h.service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    let sent_before = h.agent.sent().len();

    let response = h
        .service
        .submit(reroute_request("f1", false))
        .await
        .unwrap();
    assert!(response.is_success());

    // No rules were touched and no resources churned.
    assert_eq!(h.agent.sent().len(), sent_before);
    assert_eq!(h.store.grant_count().unwrap(), 1);
    let flow = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flow.status, FlowStatus::Up);
}

#[tokio::test]
async fn reroute_moves_flow_to_new_path() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;
    h.service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    let old_cookie = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .unwrap()
        .cookie;

    h.resolver.push_path(PROTECTED_PORT);
    let response = h
        .service
        .submit(reroute_request("f1", false))
        .await
        .unwrap();
    assert!(response.is_success(), "unexpected error: {response:?}");

    let flow = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flow.paths, Some(direct_pair(PROTECTED_PORT)));
    assert_ne!(flow.cookie, old_cookie);
    assert_eq!(flow.status, FlowStatus::Up);

    // The old path's reservation is gone; only the new link carries load.
    assert_eq!(h.store.grant_count().unwrap(), 1);
    assert_eq!(total_used(&h.store), 600);

    let removes = h
        .agent
        .sent()
        .iter()
        .filter(|c| matches!(c.kind, CommandKind::RemoveRule { .. }))
        .count();
    assert!(removes >= 2, "old rules are retired after verification");
}

#[tokio::test]
async fn unroutable_flow_fails_and_leaves_no_trace() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;
    h.resolver.push(Err(ResolveError::Unroutable {
        message: "isolated switch".into(),
    }));

    let response = h
        .service
        .submit(create_request("f1", 100, false))
        .await
        .unwrap();
    assert_eq!(response.error_type.as_deref(), Some("UNROUTABLE_FLOW"));

    assert!(h.store.find_flow(&FlowId::new("f1")).await.unwrap().is_none());
    assert_eq!(h.store.grant_count().unwrap(), 0);
    assert_eq!(total_used(&h.store), 0);
}

#[tokio::test]
async fn transient_resolver_fault_is_retried() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;
    // One engine blip, then the default direct path.
    h.resolver.push(Err(ResolveError::Recoverable {
        message: "engine restarting".into(),
    }));

    let response = h
        .service
        .submit(create_request("f1", 100, false))
        .await
        .unwrap();
    assert!(response.is_success(), "unexpected error: {response:?}");

    let flow = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .expect("flow provisioned despite the blip");
    assert_eq!(flow.status, FlowStatus::Up);
    assert_eq!(flow.paths, Some(direct_pair(PRIMARY_PORT)));
}

#[tokio::test]
async fn over_provisioning_is_rejected() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;

    let response = h
        .service
        .submit(create_request("f1", LINK_CAPACITY + 1, false))
        .await
        .unwrap();
    assert_eq!(
        response.error_type.as_deref(),
        Some("RESOURCE_ALLOCATION_ERROR")
    );
    assert!(h.store.find_flow(&FlowId::new("f1")).await.unwrap().is_none());
    assert_eq!(total_used(&h.store), 0);
}

#[tokio::test]
async fn hard_failure_rolls_back_installed_rules() {
    let agent = ScriptedAgent::new(|command| {
        Some(match command.kind {
            CommandKind::InstallIngress { .. } => ResponseOutcome::Error {
                code: SpeakerErrorCode::BadCommand,
                description: "malformed match".to_string(),
            },
            _ => ResponseOutcome::Success,
        })
    });
    let h = start_harness(agent, fast_config()).await;

    let response = h
        .service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    assert_eq!(
        response.error_type.as_deref(),
        Some("SWITCH_OPERATION_FAILED")
    );

    // Everything the operation did is undone.
    assert!(h.store.find_flow(&FlowId::new("f1")).await.unwrap().is_none());
    assert_eq!(h.store.grant_count().unwrap(), 0);
    assert_eq!(total_used(&h.store), 0);

    // The non-ingress rules that did install were removed during rollback.
    let removes = h
        .agent
        .sent()
        .iter()
        .filter(|c| matches!(c.kind, CommandKind::RemoveRule { .. }))
        .count();
    assert_eq!(removes, 2);
}

#[tokio::test]
async fn unsupported_meter_is_a_soft_success() {
    let agent = ScriptedAgent::new(|command| {
        Some(match command.kind {
            CommandKind::InstallMeter { .. } => ResponseOutcome::Error {
                code: SpeakerErrorCode::UnsupportedOperation,
                description: "switch has no meter table".to_string(),
            },
            _ => ResponseOutcome::Success,
        })
    });
    let h = start_harness(agent, fast_config()).await;

    let response = h
        .service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    assert!(response.is_success(), "unexpected error: {response:?}");
    let flow = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flow.status, FlowStatus::Up);

    // The skipped meters leave an audit trace.
    let skips = h
        .history
        .entries_for(&FlowId::new("f1"))
        .into_iter()
        .filter(|e| e.action == "command_skipped")
        .count();
    assert_eq!(skips, 2, "one skip per ingress meter");
}

#[tokio::test]
async fn missing_rule_during_delete_is_a_soft_success() {
    let agent = ScriptedAgent::new(|command| {
        Some(match command.kind {
            CommandKind::RemoveRule { .. } | CommandKind::RemoveMeter { .. } => {
                ResponseOutcome::Error {
                    code: SpeakerErrorCode::RuleMissing,
                    description: "already gone".to_string(),
                }
            }
            _ => ResponseOutcome::Success,
        })
    });
    let h = start_harness(agent, fast_config()).await;

    h.service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    let response = h.service.submit(delete_request("f1")).await.unwrap();
    assert!(response.is_success(), "unexpected error: {response:?}");
    assert!(h.store.find_flow(&FlowId::new("f1")).await.unwrap().is_none());
    assert_eq!(total_used(&h.store), 0);
}

#[tokio::test]
async fn retry_budget_bounds_attempts_per_command() {
    // One egress install keeps reporting busy; everything else succeeds.
    let agent = ScriptedAgent::new(|command| {
        Some(match command.kind {
            CommandKind::InstallEgress { .. } if command.switch_id.as_str() == "sw-b" => {
                busy("table full")
            }
            _ => ResponseOutcome::Success,
        })
    });
    let config = fast_config();
    let retry_limit = config.command_retry_limit;
    let h = start_harness(agent, config).await;

    let response = h
        .service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    assert_eq!(
        response.error_type.as_deref(),
        Some("SWITCH_OPERATION_FAILED")
    );

    let failing = h
        .agent
        .sent()
        .into_iter()
        .find(|c| {
            matches!(c.kind, CommandKind::InstallEgress { .. }) && c.switch_id.as_str() == "sw-b"
        })
        .expect("egress command sent");
    // Initial attempt plus the full retry budget, same command id each time.
    assert_eq!(
        h.agent.sends_of(failing.command_id),
        (retry_limit + 1) as usize
    );

    assert!(h.store.find_flow(&FlowId::new("f1")).await.unwrap().is_none());
    assert_eq!(total_used(&h.store), 0);
}

#[tokio::test]
async fn silent_switch_times_out_and_reverts() {
    // The sw-b egress install never answers; the tick scan must synthesize
    // timeouts until the retry budget runs out.
    let agent = ScriptedAgent::new(|command| match command.kind {
        CommandKind::InstallEgress { .. } if command.switch_id.as_str() == "sw-b" => None,
        _ => Some(ResponseOutcome::Success),
    });
    let config = fast_config();
    let retry_limit = config.command_retry_limit;
    let h = start_harness(agent, config).await;

    let response = h
        .service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    assert_eq!(response.error_type.as_deref(), Some("OPERATION_TIMED_OUT"));

    let silent = h
        .agent
        .sent()
        .into_iter()
        .find(|c| {
            matches!(c.kind, CommandKind::InstallEgress { .. }) && c.switch_id.as_str() == "sw-b"
        })
        .expect("egress command sent");
    assert_eq!(
        h.agent.sends_of(silent.command_id),
        (retry_limit + 1) as usize
    );
    assert_eq!(total_used(&h.store), 0);
}

#[tokio::test]
async fn timed_out_command_succeeds_on_retry() {
    // The sw-b egress install's first attempt vanishes; the resend with
    // the same command id is acknowledged.
    let agent = ScriptedAgent::new(|command| match command.kind {
        CommandKind::InstallEgress { .. }
            if command.switch_id.as_str() == "sw-b" && command.attempt == 0 =>
        {
            None
        }
        _ => Some(ResponseOutcome::Success),
    });
    let h = start_harness(agent, fast_config()).await;

    let response = h
        .service
        .submit(create_request("f1", 300, false))
        .await
        .unwrap();
    assert!(response.is_success(), "unexpected error: {response:?}");

    let flow = h
        .store
        .find_flow(&FlowId::new("f1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flow.status, FlowStatus::Up);

    let retried = h
        .agent
        .sent()
        .into_iter()
        .find(|c| {
            matches!(c.kind, CommandKind::InstallEgress { .. }) && c.switch_id.as_str() == "sw-b"
        })
        .expect("egress command sent");
    // The swallowed attempt plus exactly one successful resend.
    assert_eq!(h.agent.sends_of(retried.command_id), 2);
}

#[tokio::test]
async fn second_operation_on_busy_flow_is_rejected() {
    // Stall the create at the ingress step so the flow stays busy.
    let agent = ScriptedAgent::new(|command| match command.kind {
        CommandKind::InstallIngress { .. } => None,
        _ => Some(ResponseOutcome::Success),
    });
    let h = start_harness(agent, fast_config()).await;

    let service = h.service.clone();
    let create = tokio::spawn(async move {
        service.submit(create_request("f1", 300, false)).await
    });
    tokio::time::sleep(Duration::from_millis(40)).await;

    let rejected = h.service.submit(delete_request("f1")).await.unwrap();
    assert_eq!(rejected.error_type.as_deref(), Some("FLOW_BUSY"));

    // The stalled create eventually exhausts its timeouts and reverts.
    let response = create.await.unwrap().unwrap();
    assert_eq!(response.error_type.as_deref(), Some("OPERATION_TIMED_OUT"));
    assert_eq!(total_used(&h.store), 0);
}

#[tokio::test]
async fn shutdown_drains_and_flushes_history() {
    let h = start_harness(ScriptedAgent::echo(), fast_config()).await;
    h.service
        .submit(create_request("f1", 100, false))
        .await
        .unwrap();

    let service = Arc::into_inner(h.service).expect("sole owner");
    service.shutdown().await;

    let actions: Vec<String> = h
        .history
        .entries_for(&FlowId::new("f1"))
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(actions.contains(&"operation_completed".to_string()));
}
