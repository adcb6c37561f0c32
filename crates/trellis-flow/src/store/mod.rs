//! Pluggable persistence for flows, paths, and segment capacity.
//!
//! The [`FlowStore`] trait defines the repository surface the orchestration
//! layer depends on. All capacity mutations go through
//! [`FlowStore::apply_capacity_updates`], which applies a batch atomically
//! with compare-and-swap versioning and can carry a grant insert in the
//! same unit; a version conflict surfaces as a recoverable error so the
//! [`TransactionRunner`] can retry the whole read-recompute-write cycle.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: Capacity writes carry the version they were
//!   computed against, so concurrent allocations on overlapping segments
//!   never both commit into a negative balance
//! - **Testability**: In-memory implementation for tests, graph database
//!   for production deployments

pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use trellis_core::{Cookie, FlowId};

use crate::error::Result;
use crate::model::{Flow, PathSegment, ResourceGrant, SegmentCapacity};

/// A segment capacity record together with its CAS version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedCapacity {
    /// The capacity record.
    pub capacity: SegmentCapacity,
    /// Monotonic version, bumped on every committed update.
    pub version: u64,
}

/// One entry in an atomic capacity update batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityUpdate {
    /// Segment being updated.
    pub segment: PathSegment,
    /// Version the new value was computed against.
    pub expected_version: u64,
    /// Recomputed used bandwidth.
    pub new_used_bandwidth: u64,
}

/// Storage abstraction for flows, committed path grants, and capacity.
///
/// Implementations must provide atomic batch semantics for
/// `apply_capacity_updates`: either every entry (and the accompanying
/// grant, when present) commits and every version bumps, or nothing does.
#[async_trait]
pub trait FlowStore: Send + Sync {
    // --- Flow operations ---

    /// Gets a flow by ID. Returns `None` if the flow does not exist.
    async fn find_flow(&self, flow_id: &FlowId) -> Result<Option<Flow>>;

    /// Saves a flow (insert or update).
    async fn save_flow(&self, flow: &Flow) -> Result<()>;

    /// Removes a flow. Removing a missing flow is a no-op.
    async fn remove_flow(&self, flow_id: &FlowId) -> Result<()>;

    // --- Path grant operations ---

    /// Persists a committed resource grant, keyed by `(flow_id, cookie)`.
    async fn add_grant(&self, grant: &ResourceGrant) -> Result<()>;

    /// Removes a grant, returning it if it was present.
    ///
    /// Returns `None` when the grant was already removed, which makes
    /// duplicate releases no-ops.
    async fn remove_grant(&self, flow_id: &FlowId, cookie: Cookie)
    -> Result<Option<ResourceGrant>>;

    /// Returns every grant held by a flow.
    async fn grants_for_flow(&self, flow_id: &FlowId) -> Result<Vec<ResourceGrant>>;

    /// Returns every grant whose paths cross the given segment.
    ///
    /// Used to recompute `used_bandwidth` from first principles inside an
    /// allocation transaction.
    async fn grants_over_segment(&self, segment: &PathSegment) -> Result<Vec<ResourceGrant>>;

    // --- Segment capacity operations ---

    /// Gets a segment capacity record with its version.
    async fn get_segment(&self, segment: &PathSegment) -> Result<Option<VersionedCapacity>>;

    /// Creates or replaces a segment capacity record (topology seeding).
    async fn put_segment(&self, segment: &PathSegment, max_bandwidth: u64) -> Result<()>;

    /// Atomically applies a batch of capacity updates, optionally
    /// committing a grant in the same unit.
    ///
    /// When `new_grant` is given it becomes visible to
    /// [`FlowStore::grants_over_segment`] together with the version bumps
    /// computed against it, never before and never after. A reader holding
    /// a stale grant set therefore also holds a stale version and its own
    /// write is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::Recoverable`] if any entry's
    /// `expected_version` no longer matches; the caller recomputes and
    /// retries. Neither the updates nor the grant are applied in that
    /// case.
    async fn apply_capacity_updates(
        &self,
        updates: &[CapacityUpdate],
        new_grant: Option<&ResourceGrant>,
    ) -> Result<()>;
}

/// Bounded-retry wrapper for transactional closures.
///
/// Retries the closure on recoverable errors (transient persistence
/// faults, CAS version conflicts) up to the configured attempt budget with
/// an optional fixed delay, then surfaces the error unchanged.
#[derive(Debug, Clone)]
pub struct TransactionRunner {
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for TransactionRunner {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}

impl TransactionRunner {
    /// Creates a runner with the given retry budget and delay between
    /// attempts.
    #[must_use]
    pub const fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Runs the closure, retrying on recoverable errors.
    ///
    /// # Errors
    ///
    /// Returns the closure's error once the retry budget is exhausted or a
    /// non-retryable error occurs.
    pub async fn run<T, F, Fut>(&self, label: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        label,
                        attempt,
                        max_retries = self.max_retries,
                        error = %err,
                        "retrying transaction"
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::warn!(
                            label,
                            attempts = attempt + 1,
                            error = %err,
                            "transaction retry budget exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
