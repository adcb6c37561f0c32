//! Transactional resource ledger: path, cookie, meter, and bandwidth
//! bookkeeping.
//!
//! The ledger is the only component allowed to mutate segment capacity.
//! [`ResourceLedger::allocate`] performs the whole reservation inside one
//! retried transaction: allocate-or-reuse a cookie and meters, recompute
//! `used_bandwidth` for every touched segment from the committed grants
//! (reusing bandwidth held by paths being replaced), reject the whole
//! attempt if any segment would go negative, and persist the new path.
//!
//! Concurrent allocations on overlapping segments serialize through the
//! store's CAS versioning: the grant commits in the same atomic unit as
//! the capacity writes, a conflicting write surfaces as a recoverable
//! error, and the transaction recomputes from fresh state.

use std::sync::{Arc, Mutex};

use trellis_core::{Cookie, FlowId, MeterId};

use crate::error::{Error, Result};
use crate::model::{Flow, PathPair, PathSegment, ResourceGrant};
use crate::store::{CapacityUpdate, FlowStore, TransactionRunner};

/// Base value for allocated cookies; the high bit tags trellis-owned rules.
const COOKIE_BASE: u64 = 0x4000_0000_0000_0000;

/// First allocatable meter id. Low ids are reserved for system rules.
const METER_ID_BASE: u32 = 32;

#[derive(Debug)]
struct ResourcePools {
    next_cookie: u64,
    free_cookies: Vec<u64>,
    next_meter: u32,
    free_meters: Vec<u32>,
}

impl Default for ResourcePools {
    fn default() -> Self {
        Self {
            next_cookie: 1,
            free_cookies: Vec::new(),
            next_meter: METER_ID_BASE,
            free_meters: Vec::new(),
        }
    }
}

impl ResourcePools {
    fn take_cookie(&mut self) -> Cookie {
        if let Some(value) = self.free_cookies.pop() {
            return Cookie::new(value);
        }
        let value = COOKIE_BASE | self.next_cookie;
        self.next_cookie += 1;
        Cookie::new(value)
    }

    fn put_cookie(&mut self, cookie: Cookie) {
        self.free_cookies.push(cookie.value());
    }

    fn take_meter(&mut self) -> MeterId {
        if let Some(value) = self.free_meters.pop() {
            return MeterId::new(value);
        }
        let value = self.next_meter;
        self.next_meter += 1;
        MeterId::new(value)
    }

    fn put_meter(&mut self, meter: MeterId) {
        self.free_meters.push(meter.value());
    }
}

/// Transactional bookkeeping of path, cookie, meter, and bandwidth
/// allocation.
#[derive(Clone)]
pub struct ResourceLedger {
    store: Arc<dyn FlowStore>,
    pools: Arc<Mutex<ResourcePools>>,
    txn: TransactionRunner,
}

impl ResourceLedger {
    /// Creates a ledger over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn FlowStore>, txn: TransactionRunner) -> Self {
        Self {
            store,
            pools: Arc::new(Mutex::new(ResourcePools::default())),
            txn,
        }
    }

    /// Reserves a path pair for a flow.
    ///
    /// When `replaces` is given (reroute), bandwidth already held by that
    /// grant is reused on shared segments and its cookie is not reissued
    /// to other flows while the replacement is in flight.
    ///
    /// # Errors
    ///
    /// - [`Error::ResourceAllocation`] if any segment would go negative
    ///   (unless the flow ignores bandwidth)
    /// - [`Error::NotFound`] if a segment has no capacity record
    /// - [`Error::Recoverable`] once the transaction retry budget is
    ///   exhausted on persistence conflicts
    pub async fn allocate(
        &self,
        flow: &Flow,
        paths: &PathPair,
        replaces: Option<&ResourceGrant>,
    ) -> Result<ResourceGrant> {
        let reserved_bandwidth = if flow.ignore_bandwidth {
            0
        } else {
            flow.bandwidth
        };

        let grant = {
            let mut pools = self.pools.lock().map_err(|_| Error::storage("pool lock poisoned"))?;
            let cookie = pools.take_cookie();
            let needs_meters = reserved_bandwidth > 0;
            ResourceGrant {
                flow_id: flow.flow_id.clone(),
                paths: paths.clone(),
                cookie,
                forward_meter: needs_meters.then(|| pools.take_meter()),
                reverse_meter: needs_meters.then(|| pools.take_meter()),
                reserved_bandwidth,
            }
        };

        let result = self
            .txn
            .run("ledger.allocate", || {
                self.try_allocate(&grant, flow.ignore_bandwidth, replaces)
            })
            .await;

        if let Err(err) = result {
            // The reservation never committed; return pooled ids.
            self.return_to_pools(&grant)?;
            return Err(err);
        }

        tracing::info!(
            flow_id = %grant.flow_id,
            cookie = %grant.cookie,
            bandwidth = grant.reserved_bandwidth,
            "resources allocated"
        );
        Ok(grant)
    }

    /// Releases a grant back to the ledger.
    ///
    /// Releasing a grant that was already released is a no-op, so a
    /// duplicate rollback or a rollback racing a commit cannot free
    /// bandwidth twice.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the release transaction fails after
    /// retries.
    pub async fn release(&self, grant: &ResourceGrant) -> Result<()> {
        let removed = self
            .txn
            .run("ledger.release", || self.try_release(grant))
            .await?;

        if removed {
            self.return_to_pools(grant)?;
            tracing::info!(
                flow_id = %grant.flow_id,
                cookie = %grant.cookie,
                "resources released"
            );
        } else {
            tracing::debug!(
                flow_id = %grant.flow_id,
                cookie = %grant.cookie,
                "grant already released - no-op"
            );
        }
        Ok(())
    }

    /// Recomputes and persists `used_bandwidth` for one segment, returning
    /// the derived available bandwidth.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the segment has no capacity record.
    pub async fn update_segment_usage(&self, segment: &PathSegment) -> Result<u64> {
        self.txn
            .run("ledger.update_segment", || async {
                let versioned = self
                    .store
                    .get_segment(segment)
                    .await?
                    .ok_or_else(|| Error::not_found("segment", segment))?;
                let used = self.committed_usage(segment, None).await?;
                self.store
                    .apply_capacity_updates(
                        &[CapacityUpdate {
                            segment: segment.clone(),
                            expected_version: versioned.version,
                            new_used_bandwidth: used,
                        }],
                        None,
                    )
                    .await?;
                Ok(versioned.capacity.max_bandwidth.saturating_sub(used))
            })
            .await
    }

    /// One attempt of the allocation transaction.
    async fn try_allocate(
        &self,
        grant: &ResourceGrant,
        ignore_bandwidth: bool,
        replaces: Option<&ResourceGrant>,
    ) -> Result<()> {
        let mut updates = Vec::new();

        for segment in grant.paths.segments() {
            let versioned = self
                .store
                .get_segment(&segment)
                .await?
                .ok_or_else(|| Error::not_found("segment", &segment))?;

            let committed = self.committed_usage(&segment, replaces).await?;
            let new_used = committed + grant.reserved_bandwidth;

            if !ignore_bandwidth && new_used > versioned.capacity.max_bandwidth {
                return Err(Error::resource_allocation(format!(
                    "segment {} has {} kbps available, {} requested",
                    segment,
                    versioned.capacity.max_bandwidth.saturating_sub(committed),
                    grant.reserved_bandwidth
                )));
            }

            updates.push(CapacityUpdate {
                segment,
                expected_version: versioned.version,
                new_used_bandwidth: new_used,
            });
        }

        // The grant rides in the batch: it becomes visible to concurrent
        // recomputes together with the version bumps, so an allocation that
        // read the segment before this commit fails its own CAS instead of
        // counting usage without the grant.
        self.store.apply_capacity_updates(&updates, Some(grant)).await
    }

    /// One attempt of the release transaction. Returns false if the grant
    /// was already gone.
    async fn try_release(&self, grant: &ResourceGrant) -> Result<bool> {
        let removed = self
            .store
            .remove_grant(&grant.flow_id, grant.cookie)
            .await?;
        if removed.is_none() {
            return Ok(false);
        }

        let mut updates = Vec::new();
        for segment in grant.paths.segments() {
            let Some(versioned) = self.store.get_segment(&segment).await? else {
                continue;
            };
            let used = self.committed_usage(&segment, None).await?;
            if used != versioned.capacity.used_bandwidth {
                updates.push(CapacityUpdate {
                    segment,
                    expected_version: versioned.version,
                    new_used_bandwidth: used,
                });
            }
        }
        self.store.apply_capacity_updates(&updates, None).await?;
        Ok(true)
    }

    /// Sums the bandwidth of committed grants crossing a segment,
    /// excluding a grant being replaced so a reroute does not double-book
    /// the old path's share.
    async fn committed_usage(
        &self,
        segment: &PathSegment,
        replaces: Option<&ResourceGrant>,
    ) -> Result<u64> {
        let grants = self.store.grants_over_segment(segment).await?;
        Ok(grants
            .iter()
            .filter(|g| {
                replaces.is_none_or(|r| !(g.flow_id == r.flow_id && g.cookie == r.cookie))
            })
            .map(|g| g.reserved_bandwidth)
            .sum())
    }

    fn return_to_pools(&self, grant: &ResourceGrant) -> Result<()> {
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| Error::storage("pool lock poisoned"))?;
        pools.put_cookie(grant.cookie);
        if let Some(meter) = grant.forward_meter {
            pools.put_meter(meter);
        }
        if let Some(meter) = grant.reverse_meter {
            pools.put_meter(meter);
        }
        Ok(())
    }
}

/// Looks up committed grants for a flow, newest cookie first.
///
/// Convenience used by the orchestrator when loading the state a delete or
/// reroute operates on.
pub async fn current_grants(store: &dyn FlowStore, flow_id: &FlowId) -> Result<Vec<ResourceGrant>> {
    let mut grants = store.grants_for_flow(flow_id).await?;
    grants.sort_by(|a, b| b.cookie.cmp(&a.cookie));
    Ok(grants)
}
