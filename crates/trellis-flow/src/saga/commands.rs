//! Builders translating paths and grants into per-switch command sets.
//!
//! Pure functions: given a flow, a grant, and the operation identity they
//! return the speaker commands one step dispatches. Command ids are
//! generated here, once per logical command; retries reuse them.

use trellis_core::{CommandId, FlowId, OperationId, SwitchId};

use crate::dispatch::{CommandKind, SpeakerCommand};
use crate::model::{Flow, Path, ResourceGrant};

fn command(
    operation_id: OperationId,
    flow_id: &FlowId,
    switch_id: SwitchId,
    kind: CommandKind,
) -> SpeakerCommand {
    SpeakerCommand {
        command_id: CommandId::generate(),
        operation_id,
        flow_id: flow_id.clone(),
        switch_id,
        kind,
        attempt: 0,
    }
}

/// Transit and egress rules for one direction of a path.
fn non_ingress_for_direction(
    operation_id: OperationId,
    grant: &ResourceGrant,
    path: &Path,
    egress_out_port: u32,
) -> Vec<SpeakerCommand> {
    let mut commands = Vec::new();
    let segments = &path.segments;
    if segments.is_empty() {
        // Single-switch flow: the ingress rule does all the forwarding.
        return commands;
    }

    // Transit rules: one per intermediate switch, wiring the inbound path
    // port to the outbound path port.
    for pair in segments.windows(2) {
        commands.push(command(
            operation_id,
            &grant.flow_id,
            pair[0].dst_switch.clone(),
            CommandKind::InstallTransit {
                cookie: grant.cookie,
                in_port: pair[0].dst_port,
                out_port: pair[1].src_port,
            },
        ));
    }

    // Egress rule on the last switch.
    let last = &segments[segments.len() - 1];
    commands.push(command(
        operation_id,
        &grant.flow_id,
        last.dst_switch.clone(),
        CommandKind::InstallEgress {
            cookie: grant.cookie,
            in_port: last.dst_port,
            out_port: egress_out_port,
        },
    ));
    commands
}

/// Builds the non-ingress install step for a grant: transit and egress
/// rules for both directions.
#[must_use]
pub fn install_non_ingress(
    operation_id: OperationId,
    flow: &Flow,
    grant: &ResourceGrant,
) -> Vec<SpeakerCommand> {
    let mut commands = non_ingress_for_direction(
        operation_id,
        grant,
        &grant.paths.forward,
        flow.destination.port,
    );
    commands.extend(non_ingress_for_direction(
        operation_id,
        grant,
        &grant.paths.reverse,
        flow.source.port,
    ));
    commands
}

/// Builds the ingress install step for a grant: ingress rules for both
/// directions plus meter installs when bandwidth is enforced.
#[must_use]
pub fn install_ingress(
    operation_id: OperationId,
    flow: &Flow,
    grant: &ResourceGrant,
) -> Vec<SpeakerCommand> {
    let mut commands = Vec::new();

    let forward_out = grant
        .paths
        .forward
        .segments
        .first()
        .map_or(flow.destination.port, |s| s.src_port);
    let reverse_out = grant
        .paths
        .reverse
        .segments
        .first()
        .map_or(flow.source.port, |s| s.src_port);

    if let Some(meter) = grant.forward_meter {
        commands.push(command(
            operation_id,
            &grant.flow_id,
            flow.source.switch_id.clone(),
            CommandKind::InstallMeter {
                meter_id: meter,
                bandwidth: grant.reserved_bandwidth,
            },
        ));
    }
    commands.push(command(
        operation_id,
        &grant.flow_id,
        flow.source.switch_id.clone(),
        CommandKind::InstallIngress {
            cookie: grant.cookie,
            in_port: flow.source.port,
            out_port: forward_out,
            meter_id: grant.forward_meter,
        },
    ));

    if let Some(meter) = grant.reverse_meter {
        commands.push(command(
            operation_id,
            &grant.flow_id,
            flow.destination.switch_id.clone(),
            CommandKind::InstallMeter {
                meter_id: meter,
                bandwidth: grant.reserved_bandwidth,
            },
        ));
    }
    commands.push(command(
        operation_id,
        &grant.flow_id,
        flow.destination.switch_id.clone(),
        CommandKind::InstallIngress {
            cookie: grant.cookie,
            in_port: flow.destination.port,
            out_port: reverse_out,
            meter_id: grant.reverse_meter,
        },
    ));

    commands
}

/// Builds the verification step from the rules an operation installed.
#[must_use]
pub fn verify_installed(
    operation_id: OperationId,
    flow_id: &FlowId,
    installed: &[(SwitchId, trellis_core::Cookie)],
) -> Vec<SpeakerCommand> {
    installed
        .iter()
        .map(|(switch_id, cookie)| {
            command(
                operation_id,
                flow_id,
                switch_id.clone(),
                CommandKind::VerifyRule { cookie: *cookie },
            )
        })
        .collect()
}

/// Builds the removal step for a committed grant: rule removal on every
/// switch the paths touch plus meter removal on the ingress switches.
#[must_use]
pub fn remove_grant(
    operation_id: OperationId,
    flow: &Flow,
    grant: &ResourceGrant,
) -> Vec<SpeakerCommand> {
    let mut switches = grant.paths.switches();
    if switches.is_empty() {
        // Single-switch flow: paths carry no segments.
        switches.push(flow.source.switch_id.clone());
    }

    let mut commands: Vec<SpeakerCommand> = switches
        .into_iter()
        .map(|switch_id| {
            command(
                operation_id,
                &grant.flow_id,
                switch_id,
                CommandKind::RemoveRule {
                    cookie: grant.cookie,
                },
            )
        })
        .collect();

    if let Some(meter) = grant.forward_meter {
        commands.push(command(
            operation_id,
            &grant.flow_id,
            flow.source.switch_id.clone(),
            CommandKind::RemoveMeter { meter_id: meter },
        ));
    }
    if let Some(meter) = grant.reverse_meter {
        commands.push(command(
            operation_id,
            &grant.flow_id,
            flow.destination.switch_id.clone(),
            CommandKind::RemoveMeter { meter_id: meter },
        ));
    }
    commands
}
