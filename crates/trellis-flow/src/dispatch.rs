//! Speaker command envelopes, error classification, and per-step
//! aggregation.
//!
//! A **step** is a set of commands issued together (for example "install
//! non-ingress rules on every transit switch"). The [`StepTracker`] owns
//! the step's bookkeeping: commands still awaiting a response, per-command
//! retry counts, and commands that exhausted their retry budget. The step
//! completes only when nothing is pending; it succeeds iff nothing failed
//! terminally (soft successes count as success).
//!
//! Command kinds form a closed tagged enum rather than an open subtype
//! hierarchy; the orchestrator and the classifier switch on the tag.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use trellis_core::{CommandId, Cookie, FlowId, MeterId, OperationId, SwitchId};

use crate::error::Result;

/// The closed set of per-switch commands the orchestrator can issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Install the ingress rule (match on customer port, push to path).
    InstallIngress {
        /// Cookie tagging the rule.
        cookie: Cookie,
        /// Customer-facing input port.
        in_port: u32,
        /// First path port.
        out_port: u32,
        /// Meter applied to the rule, if bandwidth is enforced.
        #[serde(skip_serializing_if = "Option::is_none")]
        meter_id: Option<MeterId>,
    },
    /// Install a transit rule (path port to path port).
    InstallTransit {
        /// Cookie tagging the rule.
        cookie: Cookie,
        /// Input path port.
        in_port: u32,
        /// Output path port.
        out_port: u32,
    },
    /// Install the egress rule (path port to customer port).
    InstallEgress {
        /// Cookie tagging the rule.
        cookie: Cookie,
        /// Last path port.
        in_port: u32,
        /// Customer-facing output port.
        out_port: u32,
    },
    /// Remove every rule tagged with the cookie.
    RemoveRule {
        /// Cookie of the rules to remove.
        cookie: Cookie,
    },
    /// Verify a rule tagged with the cookie is present.
    VerifyRule {
        /// Cookie of the rule to verify.
        cookie: Cookie,
    },
    /// Install a meter.
    InstallMeter {
        /// Meter to install.
        meter_id: MeterId,
        /// Rate in kbps.
        bandwidth: u64,
    },
    /// Remove a meter.
    RemoveMeter {
        /// Meter to remove.
        meter_id: MeterId,
    },
}

impl CommandKind {
    /// Short label used in logs and history entries.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::InstallIngress { .. } => "install_ingress",
            Self::InstallTransit { .. } => "install_transit",
            Self::InstallEgress { .. } => "install_egress",
            Self::RemoveRule { .. } => "remove_rule",
            Self::VerifyRule { .. } => "verify_rule",
            Self::InstallMeter { .. } => "install_meter",
            Self::RemoveMeter { .. } => "remove_meter",
        }
    }

    /// Returns true for commands that remove or verify state, where a
    /// "rule already missing" response is success-with-skip rather than a
    /// failure.
    #[must_use]
    pub const fn tolerates_missing_rule(&self) -> bool {
        matches!(
            self,
            Self::RemoveRule { .. } | Self::RemoveMeter { .. } | Self::VerifyRule { .. }
        )
    }
}

/// One command sent to a switch-agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerCommand {
    /// Logical command identifier, stable across retries.
    pub command_id: CommandId,
    /// Operation that issued the command.
    pub operation_id: OperationId,
    /// Flow the command belongs to; used to route the response back to
    /// the partition owning the flow.
    pub flow_id: FlowId,
    /// Target switch.
    pub switch_id: SwitchId,
    /// Command payload.
    pub kind: CommandKind,
    /// Attempt number, starting at 0.
    pub attempt: u32,
}

/// Typed error returned by a switch-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeakerErrorCode {
    /// Switch is busy; retry later.
    SwitchBusy,
    /// Switch is not connected to the agent.
    SwitchUnavailable,
    /// Agent-side internal failure.
    InternalError,
    /// The command was malformed for this switch.
    BadCommand,
    /// The switch does not support the requested feature.
    UnsupportedOperation,
    /// The rule or meter was not present on the switch.
    RuleMissing,
}

/// Outcome carried by a speaker response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseOutcome {
    /// Command applied.
    Success,
    /// Command failed with a typed error.
    Error {
        /// Error code.
        code: SpeakerErrorCode,
        /// Human-readable description.
        description: String,
    },
}

/// Response from a switch-agent, correlated by command id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerResponse {
    /// Command this responds to.
    pub command_id: CommandId,
    /// Operation that issued the command.
    pub operation_id: OperationId,
    /// Flow the command belongs to.
    pub flow_id: FlowId,
    /// Responding switch.
    pub switch_id: SwitchId,
    /// Outcome.
    pub outcome: ResponseOutcome,
}

impl SpeakerResponse {
    /// Builds a success response echoing a command's envelope.
    #[must_use]
    pub fn success(command: &SpeakerCommand) -> Self {
        Self {
            command_id: command.command_id,
            operation_id: command.operation_id,
            flow_id: command.flow_id.clone(),
            switch_id: command.switch_id.clone(),
            outcome: ResponseOutcome::Success,
        }
    }

    /// Builds an error response echoing a command's envelope.
    #[must_use]
    pub fn error(command: &SpeakerCommand, code: SpeakerErrorCode, description: &str) -> Self {
        Self {
            command_id: command.command_id,
            operation_id: command.operation_id,
            flow_id: command.flow_id.clone(),
            switch_id: command.switch_id.clone(),
            outcome: ResponseOutcome::Error {
                code,
                description: description.to_string(),
            },
        }
    }
}

/// How a per-command error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Re-issue the same command if the retry budget allows.
    Retry,
    /// Terminal failure for this command.
    Fail,
    /// Treat as success; the feature is not applicable on this switch.
    SoftSuccess,
}

/// Classifies a speaker error against the command that provoked it.
///
/// Pure function: the only place soft-success semantics are decided.
#[must_use]
pub const fn classify(code: SpeakerErrorCode, kind: &CommandKind) -> ErrorDisposition {
    match code {
        SpeakerErrorCode::SwitchBusy
        | SpeakerErrorCode::SwitchUnavailable
        | SpeakerErrorCode::InternalError => ErrorDisposition::Retry,
        SpeakerErrorCode::BadCommand => ErrorDisposition::Fail,
        SpeakerErrorCode::UnsupportedOperation => ErrorDisposition::SoftSuccess,
        SpeakerErrorCode::RuleMissing => {
            if kind.tolerates_missing_rule() {
                ErrorDisposition::SoftSuccess
            } else {
                ErrorDisposition::Fail
            }
        }
    }
}

/// Transport to the remote switch-agents.
///
/// `send` is fire-and-forget: responses arrive asynchronously through the
/// correlation layer. Implementations must tolerate duplicate sends of the
/// same command id (retries reuse the id).
#[async_trait]
pub trait SwitchAgent: Send + Sync {
    /// Sends one command toward its target switch.
    async fn send(&self, command: SpeakerCommand) -> Result<()>;
}

/// What the tracker decided after consuming one response or timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepProgress {
    /// More responses are outstanding.
    Pending,
    /// The same logical command must be re-sent (attempt bumped).
    Resend(SpeakerCommand),
    /// Every command resolved; the step outcome is final.
    Complete(StepOutcome),
    /// The response did not match an outstanding command; dropped.
    Ignored,
}

/// Aggregate outcome of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Every command succeeded (including soft successes).
    Success,
    /// At least one command failed terminally.
    Failed {
        /// Commands that exhausted their budget or failed hard.
        failed: Vec<CommandId>,
        /// The subset of `failed` whose last fault was a missing response
        /// rather than an error. Distinguishes a silent switch from a
        /// rejecting one in the caller-visible result.
        timed_out: Vec<CommandId>,
    },
}

/// Bookkeeping for one in-flight step.
#[derive(Debug)]
pub struct StepTracker {
    pending: HashMap<CommandId, SpeakerCommand>,
    retried: HashMap<CommandId, u32>,
    failed: HashSet<CommandId>,
    timed_out: HashSet<CommandId>,
    retry_limit: u32,
}

impl StepTracker {
    /// Creates a tracker for the given command set.
    #[must_use]
    pub fn new(commands: Vec<SpeakerCommand>, retry_limit: u32) -> Self {
        let pending = commands
            .into_iter()
            .map(|c| (c.command_id, c))
            .collect();
        Self {
            pending,
            retried: HashMap::new(),
            failed: HashSet::new(),
            timed_out: HashSet::new(),
            retry_limit,
        }
    }

    /// Returns the command still awaiting a response under this id.
    #[must_use]
    pub fn pending_command(&self, command_id: CommandId) -> Option<&SpeakerCommand> {
        self.pending.get(&command_id)
    }

    /// Returns the retry count recorded for a command.
    #[must_use]
    pub fn retries_of(&self, command_id: CommandId) -> u32 {
        self.retried.get(&command_id).copied().unwrap_or(0)
    }

    /// Consumes a speaker response.
    pub fn on_response(&mut self, response: &SpeakerResponse) -> StepProgress {
        let Some(command) = self.pending.get(&response.command_id) else {
            return StepProgress::Ignored;
        };

        match &response.outcome {
            ResponseOutcome::Success => {
                self.pending.remove(&response.command_id);
                self.completion()
            }
            ResponseOutcome::Error { code, description } => {
                match classify(*code, &command.kind) {
                    ErrorDisposition::SoftSuccess => {
                        tracing::info!(
                            command_id = %response.command_id,
                            switch_id = %response.switch_id,
                            code = ?code,
                            "command skipped as soft success"
                        );
                        self.pending.remove(&response.command_id);
                        self.completion()
                    }
                    ErrorDisposition::Fail => {
                        tracing::warn!(
                            command_id = %response.command_id,
                            switch_id = %response.switch_id,
                            code = ?code,
                            description,
                            "command failed terminally"
                        );
                        self.mark_failed(response.command_id, false)
                    }
                    ErrorDisposition::Retry => self.retry_or_fail(response.command_id, false),
                }
            }
        }
    }

    /// Consumes a synthesized timeout for a command.
    ///
    /// Timeouts are routed identically to retryable errors.
    pub fn on_timeout(&mut self, command_id: CommandId) -> StepProgress {
        if !self.pending.contains_key(&command_id) {
            return StepProgress::Ignored;
        }
        self.retry_or_fail(command_id, true)
    }

    fn retry_or_fail(&mut self, command_id: CommandId, timed_out: bool) -> StepProgress {
        let attempts = self.retried.get(&command_id).copied().unwrap_or(0);
        if attempts < self.retry_limit {
            self.retried.insert(command_id, attempts + 1);
            // Re-issue the same logical command, not a new command id.
            if let Some(command) = self.pending.get_mut(&command_id) {
                command.attempt += 1;
                return StepProgress::Resend(command.clone());
            }
            StepProgress::Ignored
        } else {
            self.mark_failed(command_id, timed_out)
        }
    }

    fn mark_failed(&mut self, command_id: CommandId, timed_out: bool) -> StepProgress {
        self.pending.remove(&command_id);
        self.failed.insert(command_id);
        if timed_out {
            self.timed_out.insert(command_id);
        }
        self.completion()
    }

    fn completion(&self) -> StepProgress {
        if !self.pending.is_empty() {
            return StepProgress::Pending;
        }
        if self.failed.is_empty() {
            StepProgress::Complete(StepOutcome::Success)
        } else {
            let mut failed: Vec<CommandId> = self.failed.iter().copied().collect();
            failed.sort();
            let mut timed_out: Vec<CommandId> = self.timed_out.iter().copied().collect();
            timed_out.sort();
            StepProgress::Complete(StepOutcome::Failed { failed, timed_out })
        }
    }
}
