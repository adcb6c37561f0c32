//! Flow, path, and resource data model.
//!
//! The unit of bandwidth accounting is the directed [`PathSegment`]: a link
//! between two switch ports. A [`Path`] is an ordered list of segments, a
//! [`PathPair`] couples the forward and reverse directions, and a
//! [`ResourceGrant`] records everything one allocation reserved so it can
//! be committed or rolled back as a unit.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_core::{Cookie, FlowId, MeterId, SwitchId};

/// One endpoint of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEndpoint {
    /// Switch terminating the flow.
    pub switch_id: SwitchId,
    /// Port number on the switch.
    pub port: u32,
    /// Optional VLAN tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
}

impl FlowEndpoint {
    /// Creates an untagged endpoint.
    #[must_use]
    pub fn new(switch_id: impl Into<SwitchId>, port: u32) -> Self {
        Self {
            switch_id: switch_id.into(),
            port,
            vlan: None,
        }
    }
}

/// Operational status of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    /// Rules installed and verified.
    Up,
    /// Flow exists but traffic is not forwarding.
    Down,
    /// A lifecycle operation is mutating the flow.
    InProgress,
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "UP"),
            Self::Down => write!(f, "DOWN"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
        }
    }
}

/// Caller-supplied definition of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSpec {
    /// Source endpoint.
    pub source: FlowEndpoint,
    /// Destination endpoint.
    pub destination: FlowEndpoint,
    /// Requested bandwidth in kbps. Zero means best-effort.
    pub bandwidth: u64,
    /// When true, the flow reserves no bandwidth on its segments.
    #[serde(default)]
    pub ignore_bandwidth: bool,
    /// When true, a diverse protected path is allocated alongside the
    /// primary.
    #[serde(default)]
    pub protected_path: bool,
}

/// A provisioned flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Operator-assigned flow identifier.
    pub flow_id: FlowId,
    /// Source endpoint.
    pub source: FlowEndpoint,
    /// Destination endpoint.
    pub destination: FlowEndpoint,
    /// Requested bandwidth in kbps.
    pub bandwidth: u64,
    /// When true, the flow reserves no bandwidth.
    pub ignore_bandwidth: bool,
    /// When true, the flow carries a protected path.
    pub protected_path: bool,
    /// Operational status.
    pub status: FlowStatus,
    /// Currently committed primary paths, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<PathPair>,
    /// Currently committed protected paths, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protected_paths: Option<PathPair>,
    /// Cookie tagging the flow's rules, once allocated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<Cookie>,
    /// When the flow was first created.
    pub created_at: DateTime<Utc>,
}

impl Flow {
    /// Builds a flow in `InProgress` status from a caller spec.
    #[must_use]
    pub fn from_spec(flow_id: FlowId, spec: &FlowSpec) -> Self {
        Self {
            flow_id,
            source: spec.source.clone(),
            destination: spec.destination.clone(),
            bandwidth: spec.bandwidth,
            ignore_bandwidth: spec.ignore_bandwidth,
            protected_path: spec.protected_path,
            status: FlowStatus::InProgress,
            paths: None,
            protected_paths: None,
            cookie: None,
            created_at: Utc::now(),
        }
    }

    /// Returns true if this flow terminates on a single switch.
    #[must_use]
    pub fn is_single_switch(&self) -> bool {
        self.source.switch_id == self.destination.switch_id
    }
}

/// A directed link between two switch ports.
///
/// Segments are the unit of bandwidth accounting; the capacity table is
/// keyed by this exact tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSegment {
    /// Source switch.
    pub src_switch: SwitchId,
    /// Source port.
    pub src_port: u32,
    /// Destination switch.
    pub dst_switch: SwitchId,
    /// Destination port.
    pub dst_port: u32,
}

impl PathSegment {
    /// Creates a segment.
    #[must_use]
    pub fn new(
        src_switch: impl Into<SwitchId>,
        src_port: u32,
        dst_switch: impl Into<SwitchId>,
        dst_port: u32,
    ) -> Self {
        Self {
            src_switch: src_switch.into(),
            src_port,
            dst_switch: dst_switch.into(),
            dst_port,
        }
    }
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_switch, self.src_port, self.dst_switch, self.dst_port
        )
    }
}

/// An ordered list of segments from ingress to egress.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Path {
    /// Segments in forwarding order. Empty for single-switch flows.
    pub segments: Vec<PathSegment>,
}

impl Path {
    /// Creates a path from segments.
    #[must_use]
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Returns the ingress switch, if the path has any segments.
    #[must_use]
    pub fn ingress_switch(&self) -> Option<&SwitchId> {
        self.segments.first().map(|s| &s.src_switch)
    }

    /// Returns the egress switch, if the path has any segments.
    #[must_use]
    pub fn egress_switch(&self) -> Option<&SwitchId> {
        self.segments.last().map(|s| &s.dst_switch)
    }

    /// Returns every switch the path touches, ingress first, deduplicated.
    #[must_use]
    pub fn switches(&self) -> Vec<SwitchId> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for segment in &self.segments {
            for switch in [&segment.src_switch, &segment.dst_switch] {
                if seen.insert(switch.clone()) {
                    out.push(switch.clone());
                }
            }
        }
        out
    }

    /// Returns the switches strictly between ingress and egress.
    #[must_use]
    pub fn transit_switches(&self) -> Vec<SwitchId> {
        let all = self.switches();
        if all.len() <= 2 {
            return Vec::new();
        }
        all[1..all.len() - 1].to_vec()
    }
}

/// Forward and reverse paths for one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPair {
    /// Path from source to destination.
    pub forward: Path,
    /// Path from destination to source.
    pub reverse: Path,
}

impl PathPair {
    /// Creates a path pair.
    #[must_use]
    pub const fn new(forward: Path, reverse: Path) -> Self {
        Self { forward, reverse }
    }

    /// Returns every unique segment across both directions.
    #[must_use]
    pub fn segments(&self) -> Vec<PathSegment> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for segment in self
            .forward
            .segments
            .iter()
            .chain(self.reverse.segments.iter())
        {
            if seen.insert(segment.clone()) {
                out.push(segment.clone());
            }
        }
        out
    }

    /// Returns every unique switch across both directions.
    #[must_use]
    pub fn switches(&self) -> Vec<SwitchId> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for switch in self
            .forward
            .switches()
            .into_iter()
            .chain(self.reverse.switches())
        {
            if seen.insert(switch.clone()) {
                out.push(switch);
            }
        }
        out
    }
}

/// Per-segment bandwidth accounting record.
///
/// `available_bandwidth` is derived, never stored: it is recomputed inside
/// the same transaction that adds or removes a path using the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentCapacity {
    /// Maximum bandwidth of the link in kbps.
    pub max_bandwidth: u64,
    /// Bandwidth currently reserved by committed paths.
    pub used_bandwidth: u64,
}

impl SegmentCapacity {
    /// Creates an empty capacity record.
    #[must_use]
    pub const fn new(max_bandwidth: u64) -> Self {
        Self {
            max_bandwidth,
            used_bandwidth: 0,
        }
    }

    /// Returns the derived available bandwidth.
    #[must_use]
    pub const fn available_bandwidth(&self) -> u64 {
        self.max_bandwidth.saturating_sub(self.used_bandwidth)
    }
}

/// Everything one allocation reserved: paths, cookie, meters, bandwidth.
///
/// A grant is owned exclusively by the operation that allocated it until
/// it is committed (attached to the flow) or released back to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGrant {
    /// Flow the grant belongs to.
    pub flow_id: FlowId,
    /// The reserved path pair.
    pub paths: PathPair,
    /// Unmasked cookie tagging the rules of this path.
    pub cookie: Cookie,
    /// Meter on the forward ingress switch, if bandwidth is enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_meter: Option<MeterId>,
    /// Meter on the reverse ingress switch, if bandwidth is enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse_meter: Option<MeterId>,
    /// Bandwidth this grant reserves on each of its segments. Zero when
    /// the flow ignores bandwidth.
    pub reserved_bandwidth: u64,
}
