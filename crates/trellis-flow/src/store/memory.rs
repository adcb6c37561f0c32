//! In-memory store implementation for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process
//!   coordination
//! - **Single-process only**: State is not shared across process boundaries

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use trellis_core::{Cookie, FlowId};

use super::{CapacityUpdate, FlowStore, VersionedCapacity};
use crate::error::{Error, Result};
use crate::model::{Flow, PathSegment, ResourceGrant, SegmentCapacity};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

#[derive(Debug, Default)]
struct Inner {
    flows: HashMap<FlowId, Flow>,
    grants: HashMap<(FlowId, u64), ResourceGrant>,
    segments: HashMap<PathSegment, VersionedCapacity>,
}

/// In-memory store for testing.
///
/// Thread-safe via a single `RwLock`; `apply_capacity_updates` holds the
/// write lock for the whole batch, which gives the atomic all-or-nothing
/// semantics the trait requires.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    inner: RwLock<Inner>,
}

impl InMemoryFlowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of grants currently stored.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn grant_count(&self) -> Result<usize> {
        Ok(self.inner.read().map_err(poison_err)?.grants.len())
    }

    /// Returns the capacity record for a segment, for test assertions.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lock is poisoned.
    pub fn capacity_of(&self, segment: &PathSegment) -> Result<Option<SegmentCapacity>> {
        Ok(self
            .inner
            .read()
            .map_err(poison_err)?
            .segments
            .get(segment)
            .map(|v| v.capacity))
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn find_flow(&self, flow_id: &FlowId) -> Result<Option<Flow>> {
        Ok(self
            .inner
            .read()
            .map_err(poison_err)?
            .flows
            .get(flow_id)
            .cloned())
    }

    async fn save_flow(&self, flow: &Flow) -> Result<()> {
        self.inner
            .write()
            .map_err(poison_err)?
            .flows
            .insert(flow.flow_id.clone(), flow.clone());
        Ok(())
    }

    async fn remove_flow(&self, flow_id: &FlowId) -> Result<()> {
        self.inner.write().map_err(poison_err)?.flows.remove(flow_id);
        Ok(())
    }

    async fn add_grant(&self, grant: &ResourceGrant) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let key = (grant.flow_id.clone(), grant.cookie.value());
        if inner.grants.contains_key(&key) {
            return Err(Error::internal(format!(
                "grant already exists for flow {} cookie {}",
                grant.flow_id, grant.cookie
            )));
        }
        inner.grants.insert(key, grant.clone());
        Ok(())
    }

    async fn remove_grant(
        &self,
        flow_id: &FlowId,
        cookie: Cookie,
    ) -> Result<Option<ResourceGrant>> {
        Ok(self
            .inner
            .write()
            .map_err(poison_err)?
            .grants
            .remove(&(flow_id.clone(), cookie.value())))
    }

    async fn grants_for_flow(&self, flow_id: &FlowId) -> Result<Vec<ResourceGrant>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut grants: Vec<ResourceGrant> = inner
            .grants
            .values()
            .filter(|g| &g.flow_id == flow_id)
            .cloned()
            .collect();
        grants.sort_by_key(|g| g.cookie);
        Ok(grants)
    }

    async fn grants_over_segment(&self, segment: &PathSegment) -> Result<Vec<ResourceGrant>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut grants: Vec<ResourceGrant> = inner
            .grants
            .values()
            .filter(|g| g.paths.segments().contains(segment))
            .cloned()
            .collect();
        grants.sort_by_key(|g| g.cookie);
        Ok(grants)
    }

    async fn get_segment(&self, segment: &PathSegment) -> Result<Option<VersionedCapacity>> {
        Ok(self
            .inner
            .read()
            .map_err(poison_err)?
            .segments
            .get(segment)
            .copied())
    }

    async fn put_segment(&self, segment: &PathSegment, max_bandwidth: u64) -> Result<()> {
        self.inner.write().map_err(poison_err)?.segments.insert(
            segment.clone(),
            VersionedCapacity {
                capacity: SegmentCapacity::new(max_bandwidth),
                version: 0,
            },
        );
        Ok(())
    }

    async fn apply_capacity_updates(
        &self,
        updates: &[CapacityUpdate],
        new_grant: Option<&ResourceGrant>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        // Validate the whole batch before touching anything.
        for update in updates {
            match inner.segments.get(&update.segment) {
                None => {
                    return Err(Error::not_found("segment", &update.segment));
                }
                Some(existing) if existing.version != update.expected_version => {
                    return Err(Error::recoverable(format!(
                        "capacity version conflict on {}: expected {}, found {}",
                        update.segment, update.expected_version, existing.version
                    )));
                }
                Some(_) => {}
            }
        }
        if let Some(grant) = new_grant {
            let key = (grant.flow_id.clone(), grant.cookie.value());
            if inner.grants.contains_key(&key) {
                return Err(Error::internal(format!(
                    "grant already exists for flow {} cookie {}",
                    grant.flow_id, grant.cookie
                )));
            }
        }

        for update in updates {
            if let Some(existing) = inner.segments.get_mut(&update.segment) {
                existing.capacity.used_bandwidth = update.new_used_bandwidth;
                existing.version += 1;
            }
        }
        if let Some(grant) = new_grant {
            inner
                .grants
                .insert((grant.flow_id.clone(), grant.cookie.value()), grant.clone());
        }
        Ok(())
    }
}
