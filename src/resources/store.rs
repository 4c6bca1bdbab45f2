//! Backing store for resource leases.
//!
//! Every method of [`AllocationStore`] is one atomic operation: the check,
//! the debit or credit, and the status change happen together or not at all.
//! A multi-process deployment must implement the trait on a shared store
//! with server-side atomic updates (compare-and-swap or scripted updates).
//!
//! [`InMemoryAllocationStore`] keeps everything behind one mutex. It is only
//! correct when every allocator that shares it lives in the same process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::allocation::{
    Allocation, AllocationId, AllocationLevel, AllocationStatus, ReleaseOutcome,
};
use super::pool::ResourcePool;
use crate::core::error::{EngineError, EngineResult};

/// A child lease the allocator has already validated and sized
#[derive(Debug, Clone)]
pub struct ChildGrant {
    pub owner_id: String,
    pub level: AllocationLevel,
    /// Minimum the parent's remaining pool must cover
    pub estimated: ResourcePool,
    /// Amount to reserve; clamped to the parent's remaining but never below `estimated`
    pub reservation: ResourcePool,
    /// Requested deadline; clamped to the parent's deadline
    pub expires_at: DateTime<Utc>,
}

/// Atomic operations over the lease table
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Register a swarm pool. Fails if the owner already has an active pool.
    async fn insert_root(&self, allocation: Allocation) -> EngineResult<()>;

    /// Active root lease for a swarm, if any
    async fn root_for(&self, owner_id: &str) -> EngineResult<Option<AllocationId>>;

    /// Check eligibility, debit the parent and insert the child
    async fn grant_child(
        &self,
        parent_id: AllocationId,
        grant: ChildGrant,
        now: DateTime<Utc>,
    ) -> EngineResult<Allocation>;

    /// Release a lease with its actual usage, settling active children first
    async fn settle(&self, id: AllocationId, usage: ResourcePool) -> EngineResult<ReleaseOutcome>;

    /// Credit an expired active lease back to its parent. Returns the lease
    /// only for the caller that performed the reclaim.
    async fn reclaim_if_expired(
        &self,
        id: AllocationId,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Allocation>>;

    /// Stop a lease from issuing new children
    async fn freeze(&self, id: AllocationId) -> EngineResult<()>;

    async fn get(&self, id: AllocationId) -> EngineResult<Option<Allocation>>;

    async fn children_of(&self, id: AllocationId) -> EngineResult<Vec<Allocation>>;

    /// Active leases whose deadline is at or before `now`
    async fn expired_ids(&self, now: DateTime<Utc>) -> EngineResult<Vec<AllocationId>>;
}

#[derive(Debug, Default)]
struct AllocationTable {
    allocations: HashMap<AllocationId, Allocation>,
    children: HashMap<AllocationId, Vec<AllocationId>>,
    roots: HashMap<String, AllocationId>,
}

impl AllocationTable {
    fn require(&self, id: AllocationId) -> EngineResult<&Allocation> {
        self.allocations
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("allocation {}", id)))
    }

    fn require_mut(&mut self, id: AllocationId) -> EngineResult<&mut Allocation> {
        self.allocations
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("allocation {}", id)))
    }

    /// The lease and all its ancestors must be active, unfrozen and unexpired
    fn check_eligible(&self, id: AllocationId, now: DateTime<Utc>) -> EngineResult<()> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let alloc = self.require(current)?;
            if !alloc.is_active() {
                return Err(EngineError::NotEligible(format!(
                    "{} lease {} is {:?}",
                    alloc.level, alloc.id, alloc.status
                )));
            }
            if alloc.frozen {
                return Err(EngineError::NotEligible(format!(
                    "{} lease {} is frozen",
                    alloc.level, alloc.id
                )));
            }
            if alloc.expires_at <= now {
                return Err(EngineError::NotEligible(format!(
                    "{} lease {} expired at {}",
                    alloc.level, alloc.id, alloc.expires_at
                )));
            }
            cursor = alloc.parent_id;
        }
        Ok(())
    }

    fn grant_child(
        &mut self,
        parent_id: AllocationId,
        grant: ChildGrant,
        now: DateTime<Utc>,
    ) -> EngineResult<Allocation> {
        self.check_eligible(parent_id, now)?;

        let parent = self.require_mut(parent_id)?;
        if !parent.remaining.covers(&grant.estimated) {
            return Err(EngineError::ResourceExhausted(format!(
                "{} lease {} has {} left, {} requested by {}",
                parent.level, parent.id, parent.remaining, grant.estimated, grant.owner_id
            )));
        }

        let amount = grant
            .reservation
            .min(&parent.remaining)
            .max(&grant.estimated);
        parent.remaining = parent.remaining.checked_sub(&amount).ok_or_else(|| {
            EngineError::AllocationConsistency(format!(
                "grant of {} exceeds remaining {} on {}",
                amount, parent.remaining, parent.id
            ))
        })?;
        let expires_at = grant.expires_at.min(parent.expires_at);

        let child = Allocation {
            id: AllocationId::new(),
            owner_id: grant.owner_id,
            parent_id: Some(parent_id),
            level: grant.level,
            allocated: amount,
            remaining: amount,
            allocated_at: now,
            expires_at,
            status: AllocationStatus::Active,
            reclaimed: false,
            frozen: false,
            usage: None,
        };

        self.children.entry(parent_id).or_default().push(child.id);
        self.allocations.insert(child.id, child.clone());
        Ok(child)
    }

    fn credit_parent(
        &mut self,
        parent_id: Option<AllocationId>,
        credit: ResourcePool,
        child_id: AllocationId,
    ) -> EngineResult<()> {
        let Some(parent_id) = parent_id else {
            return Ok(());
        };
        let parent = self.require_mut(parent_id)?;
        if !parent.is_active() {
            return Err(EngineError::AllocationConsistency(format!(
                "child {} credited settled parent {}",
                child_id, parent_id
            )));
        }
        let credited = parent
            .remaining
            .checked_add(&credit)
            .filter(|pool| parent.allocated.covers(pool))
            .ok_or_else(|| {
                EngineError::AllocationConsistency(format!(
                    "over-credit: {} + {} exceeds allocated {} on {}",
                    parent.remaining, credit, parent.allocated, parent_id
                ))
            })?;
        parent.remaining = credited;
        Ok(())
    }

    fn active_children(&self, id: AllocationId) -> Vec<AllocationId> {
        self.children
            .get(&id)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|child| {
                        self.allocations
                            .get(child)
                            .map(|a| a.is_active())
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn settle(&mut self, id: AllocationId, usage: ResourcePool) -> EngineResult<ReleaseOutcome> {
        if !self.require(id)?.is_active() {
            return Ok(ReleaseOutcome::AlreadySettled);
        }

        for child in self.active_children(id) {
            self.settle(child, ResourcePool::default())?;
        }

        let alloc = self.require(id)?;
        let usage = usage.min(&alloc.allocated);
        let credit = alloc.allocated.saturating_sub(&usage);
        let parent_id = alloc.parent_id;

        self.credit_parent(parent_id, credit, id)?;

        let alloc = self.require_mut(id)?;
        alloc.status = AllocationStatus::Released;
        alloc.usage = Some(usage);
        if alloc.parent_id.is_none() {
            self.roots.retain(|_, root| *root != id);
        }
        Ok(ReleaseOutcome::Released { credited: credit })
    }

    fn reclaim(&mut self, id: AllocationId) -> EngineResult<bool> {
        let alloc = self.require(id)?;
        if !alloc.is_active() || alloc.reclaimed {
            return Ok(false);
        }

        for child in self.active_children(id) {
            self.reclaim(child)?;
        }

        let alloc = self.require(id)?;
        let credit = alloc.allocated;
        let parent_id = alloc.parent_id;
        self.credit_parent(parent_id, credit, id)?;

        let alloc = self.require_mut(id)?;
        alloc.status = AllocationStatus::Reclaimed;
        alloc.reclaimed = true;
        debug!("Reclaimed {} lease {} ({})", alloc.level, alloc.id, alloc.allocated);
        if alloc.parent_id.is_none() {
            self.roots.retain(|_, root| *root != id);
        }
        Ok(true)
    }
}

/// Single-process lease table. Not safe to share between worker processes.
#[derive(Debug, Default)]
pub struct InMemoryAllocationStore {
    table: Mutex<AllocationTable>,
}

impl InMemoryAllocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AllocationStore for InMemoryAllocationStore {
    async fn insert_root(&self, allocation: Allocation) -> EngineResult<()> {
        let mut table = self.table.lock().await;
        if let Some(existing) = table.roots.get(&allocation.owner_id) {
            return Err(EngineError::Configuration(format!(
                "swarm {} already has an open pool {}",
                allocation.owner_id, existing
            )));
        }
        table.roots.insert(allocation.owner_id.clone(), allocation.id);
        table.allocations.insert(allocation.id, allocation);
        Ok(())
    }

    async fn root_for(&self, owner_id: &str) -> EngineResult<Option<AllocationId>> {
        let table = self.table.lock().await;
        Ok(table.roots.get(owner_id).copied())
    }

    async fn grant_child(
        &self,
        parent_id: AllocationId,
        grant: ChildGrant,
        now: DateTime<Utc>,
    ) -> EngineResult<Allocation> {
        let mut table = self.table.lock().await;
        table.grant_child(parent_id, grant, now)
    }

    async fn settle(&self, id: AllocationId, usage: ResourcePool) -> EngineResult<ReleaseOutcome> {
        let mut table = self.table.lock().await;
        table.settle(id, usage)
    }

    async fn reclaim_if_expired(
        &self,
        id: AllocationId,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Allocation>> {
        let mut table = self.table.lock().await;
        let expired = table.require(id)?.is_expired_at(now);
        if !expired || !table.reclaim(id)? {
            return Ok(None);
        }
        Ok(table.allocations.get(&id).cloned())
    }

    async fn freeze(&self, id: AllocationId) -> EngineResult<()> {
        let mut table = self.table.lock().await;
        table.require_mut(id)?.frozen = true;
        Ok(())
    }

    async fn get(&self, id: AllocationId) -> EngineResult<Option<Allocation>> {
        let table = self.table.lock().await;
        Ok(table.allocations.get(&id).cloned())
    }

    async fn children_of(&self, id: AllocationId) -> EngineResult<Vec<Allocation>> {
        let table = self.table.lock().await;
        Ok(table
            .children
            .get(&id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|child| table.allocations.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn expired_ids(&self, now: DateTime<Utc>) -> EngineResult<Vec<AllocationId>> {
        let table = self.table.lock().await;
        Ok(table
            .allocations
            .values()
            .filter(|a| a.is_expired_at(now))
            .map(|a| a.id)
            .collect())
    }
}
