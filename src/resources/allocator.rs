use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::allocation::{
    Allocation, AllocationId, AllocationLevel, AllocationRequest, AllocationStatus, ReleaseOutcome,
};
use super::pool::ResourcePool;
use super::store::{AllocationStore, ChildGrant};
use crate::core::config::AllocatorConfig;
use crate::core::error::{EngineError, EngineResult};

/// Issues hierarchical, time-bounded resource leases.
///
/// The allocator itself is stateless: every decision is made inside one
/// atomic [`AllocationStore`] operation, so several allocators (one per
/// worker) may share a store.
pub struct ResourceAllocator {
    store: Arc<dyn AllocationStore>,
    max_lease_ms: u64,
}

impl ResourceAllocator {
    pub fn new(store: Arc<dyn AllocationStore>, config: &AllocatorConfig) -> Self {
        Self {
            store,
            max_lease_ms: config.max_lease_ms,
        }
    }

    /// The store this allocator writes to
    pub fn store(&self) -> Arc<dyn AllocationStore> {
        self.store.clone()
    }

    fn deadline(&self, now: DateTime<Utc>, duration_ms: u64) -> DateTime<Utc> {
        let bounded = duration_ms.min(self.max_lease_ms);
        now + Duration::milliseconds(bounded as i64)
    }

    /// Open the root pool a swarm draws all of its runs from
    pub async fn open_swarm_pool(
        &self,
        swarm_id: &str,
        pool: ResourcePool,
        duration_ms: u64,
    ) -> EngineResult<Allocation> {
        let now = Utc::now();
        let allocation = Allocation {
            id: AllocationId::new(),
            owner_id: swarm_id.to_string(),
            parent_id: None,
            level: AllocationLevel::Swarm,
            allocated: pool,
            remaining: pool,
            allocated_at: now,
            expires_at: self.deadline(now, duration_ms),
            status: AllocationStatus::Active,
            reclaimed: false,
            frozen: false,
            usage: None,
        };
        self.store.insert_root(allocation.clone()).await?;
        info!("Opened pool {} for swarm {}: {}", allocation.id, swarm_id, pool);
        Ok(allocation)
    }

    /// Root pool of a swarm
    pub async fn swarm_pool(&self, swarm_id: &str) -> EngineResult<Allocation> {
        let id = self
            .store
            .root_for(swarm_id)
            .await?
            .ok_or_else(|| EngineError::NotEligible(format!("swarm {} has no open pool", swarm_id)))?;
        self.get(id).await
    }

    /// Lease resources for a run out of its swarm's pool
    pub async fn allocate_for_run(
        &self,
        swarm_id: &str,
        request: AllocationRequest,
    ) -> EngineResult<Allocation> {
        let root = self
            .store
            .root_for(swarm_id)
            .await?
            .ok_or_else(|| EngineError::NotEligible(format!("swarm {} has no open pool", swarm_id)))?;
        self.allocate_child(root, AllocationLevel::Swarm, AllocationLevel::Run, request)
            .await
    }

    /// Lease resources for a step out of its run's lease
    pub async fn allocate_for_step(
        &self,
        run_allocation: AllocationId,
        request: AllocationRequest,
    ) -> EngineResult<Allocation> {
        self.allocate_child(
            run_allocation,
            AllocationLevel::Run,
            AllocationLevel::Step,
            request,
        )
        .await
    }

    /// Lease resources for a sub-routine run out of the step that spawned it
    pub async fn allocate_nested_run(
        &self,
        step_allocation: AllocationId,
        request: AllocationRequest,
    ) -> EngineResult<Allocation> {
        self.allocate_child(
            step_allocation,
            AllocationLevel::Step,
            AllocationLevel::Run,
            request,
        )
        .await
    }

    async fn allocate_child(
        &self,
        parent_id: AllocationId,
        parent_level: AllocationLevel,
        level: AllocationLevel,
        request: AllocationRequest,
    ) -> EngineResult<Allocation> {
        let now = Utc::now();
        // Settles the parent first if its lease already ran out
        let parent = self.get(parent_id).await?;
        if parent.level != parent_level {
            return Err(EngineError::Configuration(format!(
                "{} lease requested under {} lease {}, expected a {} lease",
                level, parent.level, parent_id, parent_level
            )));
        }

        let grant = ChildGrant {
            owner_id: request.owner_id.clone(),
            level,
            estimated: request.estimated,
            reservation: request.reservation.unwrap_or(request.estimated),
            expires_at: self.deadline(now, request.duration_ms),
        };

        match self.store.grant_child(parent_id, grant, now).await {
            Ok(allocation) => {
                debug!(
                    "Granted {} lease {} to {} ({}), expires {}",
                    level, allocation.id, allocation.owner_id, allocation.allocated, allocation.expires_at
                );
                Ok(allocation)
            }
            Err(e) => {
                warn!("Rejected {} lease for {}: {}", level, request.owner_id, e);
                Err(e)
            }
        }
    }

    /// Return a lease with its actual usage. Safe to call more than once.
    pub async fn release(
        &self,
        id: AllocationId,
        actual_usage: ResourcePool,
    ) -> EngineResult<ReleaseOutcome> {
        if let Some(alloc) = self.store.get(id).await? {
            if alloc.is_active() && !alloc.allocated.covers(&actual_usage) {
                warn!(
                    "{} lease {} overran its grant: used {}, allocated {}",
                    alloc.level, id, actual_usage, alloc.allocated
                );
            }
        }

        match self.store.settle(id, actual_usage).await {
            Ok(outcome) => {
                match &outcome {
                    ReleaseOutcome::Released { credited } => {
                        debug!("Released lease {}, credited {}", id, credited)
                    }
                    ReleaseOutcome::AlreadySettled => {
                        debug!("Lease {} already settled, release ignored", id)
                    }
                }
                Ok(outcome)
            }
            Err(e @ EngineError::AllocationConsistency(_)) => {
                error!("Allocation consistency violation on release of {}: {}", id, e);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Release a lease and everything under it without further usage
    pub async fn release_tree(&self, id: AllocationId) -> EngineResult<ReleaseOutcome> {
        self.release(id, ResourcePool::default()).await
    }

    /// Stop a lease from issuing new children
    pub async fn freeze(&self, id: AllocationId) -> EngineResult<()> {
        self.store.freeze(id).await?;
        info!("Froze lease {}", id);
        Ok(())
    }

    /// Read a lease, reclaiming it first if it has expired
    pub async fn get(&self, id: AllocationId) -> EngineResult<Allocation> {
        if let Some(reclaimed) = self.store.reclaim_if_expired(id, Utc::now()).await? {
            info!(
                "Lazily reclaimed expired {} lease {} ({})",
                reclaimed.level, reclaimed.id, reclaimed.allocated
            );
        }
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("allocation {}", id)))
    }

    /// Active children of a lease
    pub async fn children(&self, id: AllocationId) -> EngineResult<Vec<Allocation>> {
        self.store.children_of(id).await
    }

    /// Reclaim every lease that has expired by now
    pub async fn sweep_expired(&self) -> EngineResult<Vec<AllocationId>> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Reclaim every lease that has expired by `now`. Each lease is credited
    /// back exactly once even when sweeps overlap.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> EngineResult<Vec<AllocationId>> {
        let mut reclaimed = Vec::new();
        for id in self.store.expired_ids(now).await? {
            match self.store.reclaim_if_expired(id, now).await {
                Ok(Some(alloc)) => {
                    info!(
                        "Sweep reclaimed {} lease {} held by {} ({})",
                        alloc.level, alloc.id, alloc.owner_id, alloc.allocated
                    );
                    reclaimed.push(id);
                }
                Ok(None) => {}
                Err(e @ EngineError::AllocationConsistency(_)) => {
                    error!("Allocation consistency violation during sweep: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("Failed to reclaim lease {}: {}", id, e),
            }
        }
        Ok(reclaimed)
    }

    /// Run [`Self::sweep_expired`] every `interval_ms` until `shutdown` fires
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval_ms: u64,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Lease sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_expired().await {
                            error!("Lease sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::store::InMemoryAllocationStore;
    use proptest::prelude::*;

    fn allocator() -> ResourceAllocator {
        ResourceAllocator::new(
            Arc::new(InMemoryAllocationStore::new()),
            &AllocatorConfig::default(),
        )
    }

    fn run_request(credits: u64) -> AllocationRequest {
        AllocationRequest::new("run", ResourcePool::credits(credits), 60_000)
    }

    #[tokio::test]
    async fn test_credit_scenario_grant_reject_release() {
        let alloc = allocator();
        alloc
            .open_swarm_pool("swarm-1", ResourcePool::credits(100), 60_000)
            .await
            .unwrap();

        let first = alloc.allocate_for_run("swarm-1", run_request(40)).await.unwrap();
        assert_eq!(first.allocated.credits, 40);
        assert_eq!(alloc.swarm_pool("swarm-1").await.unwrap().remaining.credits, 60);

        let second = alloc.allocate_for_run("swarm-1", run_request(70)).await;
        assert!(matches!(second, Err(EngineError::ResourceExhausted(_))));

        alloc
            .release(first.id, ResourcePool::credits(25))
            .await
            .unwrap();
        // 40 reserved, 25 consumed: 15 flows back onto the 60 left
        assert_eq!(alloc.swarm_pool("swarm-1").await.unwrap().remaining.credits, 75);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let alloc = allocator();
        alloc
            .open_swarm_pool("swarm-1", ResourcePool::credits(100), 60_000)
            .await
            .unwrap();
        let run = alloc.allocate_for_run("swarm-1", run_request(40)).await.unwrap();

        let first = alloc.release(run.id, ResourcePool::credits(10)).await.unwrap();
        assert_eq!(
            first,
            ReleaseOutcome::Released {
                credited: ResourcePool::credits(30)
            }
        );
        let second = alloc.release(run.id, ResourcePool::credits(0)).await.unwrap();
        assert_eq!(second, ReleaseOutcome::AlreadySettled);
        assert_eq!(alloc.swarm_pool("swarm-1").await.unwrap().remaining.credits, 90);
    }

    #[tokio::test]
    async fn test_step_lease_requires_run_parent() {
        let alloc = allocator();
        let pool = alloc
            .open_swarm_pool("swarm-1", ResourcePool::credits(100), 60_000)
            .await
            .unwrap();
        let err = alloc
            .allocate_for_step(pool.id, run_request(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_run_step_budget_caps_step_count() {
        let alloc = allocator();
        alloc
            .open_swarm_pool("swarm-1", ResourcePool::credits(100).with_steps(10), 60_000)
            .await
            .unwrap();
        let run = alloc
            .allocate_for_run(
                "swarm-1",
                AllocationRequest::new("run", ResourcePool::credits(10).with_steps(2), 60_000),
            )
            .await
            .unwrap();

        let step = AllocationRequest::new("step", ResourcePool::credits(1).with_steps(1), 1_000);
        alloc.allocate_for_step(run.id, step.clone()).await.unwrap();
        alloc.allocate_for_step(run.id, step.clone()).await.unwrap();
        let third = alloc.allocate_for_step(run.id, step).await;
        assert!(matches!(third, Err(EngineError::ResourceExhausted(_))));
    }

    #[tokio::test]
    async fn test_frozen_swarm_rejects_new_runs() {
        let alloc = allocator();
        let pool = alloc
            .open_swarm_pool("swarm-1", ResourcePool::credits(100), 60_000)
            .await
            .unwrap();
        alloc.freeze(pool.id).await.unwrap();
        let err = alloc.allocate_for_run("swarm-1", run_request(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::NotEligible(_)));
    }

    #[tokio::test]
    async fn test_lease_duration_capped_by_ceiling() {
        let config = AllocatorConfig {
            max_lease_ms: 1_000,
            ..AllocatorConfig::default()
        };
        let alloc = ResourceAllocator::new(Arc::new(InMemoryAllocationStore::new()), &config);
        let pool = alloc
            .open_swarm_pool("swarm-1", ResourcePool::credits(10), 10_000_000)
            .await
            .unwrap();
        assert!(pool.expires_at - pool.allocated_at <= Duration::milliseconds(1_000));
    }

    #[tokio::test]
    async fn test_expired_run_lease_reclaimed_once_by_concurrent_sweeps() {
        let store: Arc<dyn AllocationStore> = Arc::new(InMemoryAllocationStore::new());
        let worker_a = ResourceAllocator::new(store.clone(), &AllocatorConfig::default());
        let worker_b = ResourceAllocator::new(store.clone(), &AllocatorConfig::default());

        worker_a
            .open_swarm_pool("swarm-1", ResourcePool::credits(100), 600_000)
            .await
            .unwrap();
        let run = worker_a
            .allocate_for_run(
                "swarm-1",
                AllocationRequest::new("run", ResourcePool::credits(30), 1_000),
            )
            .await
            .unwrap();

        let later = Utc::now() + Duration::seconds(5);
        let (a, b) = tokio::join!(worker_a.sweep_expired_at(later), worker_b.sweep_expired_at(later));
        let total = a.unwrap().len() + b.unwrap().len();
        assert_eq!(total, 1);

        let run = store.get(run.id).await.unwrap().unwrap();
        assert!(run.reclaimed);
        assert_eq!(run.status, AllocationStatus::Reclaimed);
        assert_eq!(worker_b.swarm_pool("swarm-1").await.unwrap().remaining.credits, 100);

        // A late release from the crashed holder must not credit again
        let outcome = worker_a.release(run.id, ResourcePool::default()).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::AlreadySettled);
        assert_eq!(worker_b.swarm_pool("swarm-1").await.unwrap().remaining.credits, 100);
    }

    #[tokio::test]
    async fn test_expired_lease_reclaimed_lazily_on_read() {
        let alloc = allocator();
        alloc
            .open_swarm_pool("swarm-1", ResourcePool::credits(50), 600_000)
            .await
            .unwrap();
        let run = alloc
            .allocate_for_run("swarm-1", AllocationRequest::new("run", ResourcePool::credits(20), 1))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let read = alloc.get(run.id).await.unwrap();
        assert_eq!(read.status, AllocationStatus::Reclaimed);
        assert_eq!(alloc.swarm_pool("swarm-1").await.unwrap().remaining.credits, 50);
    }

    proptest! {
        #[test]
        fn prop_grant_debits_exactly_allocated(pool in 0u64..10_000, ask in 0u64..10_000) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let alloc = allocator();
                alloc.open_swarm_pool("swarm", ResourcePool::credits(pool), 60_000).await.unwrap();
                let before = alloc.swarm_pool("swarm").await.unwrap().remaining.credits;

                match alloc.allocate_for_run("swarm", run_request(ask)).await {
                    Ok(run) => {
                        prop_assert!(run.allocated.credits <= before);
                        let after = alloc.swarm_pool("swarm").await.unwrap().remaining.credits;
                        prop_assert_eq!(before - after, run.allocated.credits);
                    }
                    Err(EngineError::ResourceExhausted(_)) => {
                        prop_assert!(ask > before);
                        let after = alloc.swarm_pool("swarm").await.unwrap().remaining.credits;
                        prop_assert_eq!(before, after);
                    }
                    Err(e) => prop_assert!(false, "unexpected error {}", e),
                }
                Ok(())
            })?;
        }

        #[test]
        fn prop_release_twice_credits_once(ask in 1u64..100, used in 0u64..150) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let alloc = allocator();
                alloc.open_swarm_pool("swarm", ResourcePool::credits(100), 60_000).await.unwrap();
                let run = alloc.allocate_for_run("swarm", run_request(ask)).await.unwrap();

                alloc.release(run.id, ResourcePool::credits(used)).await.unwrap();
                let once = alloc.swarm_pool("swarm").await.unwrap().remaining;
                alloc.release(run.id, ResourcePool::credits(used)).await.unwrap();
                let twice = alloc.swarm_pool("swarm").await.unwrap().remaining;

                prop_assert_eq!(once, twice);
                prop_assert!(once.credits <= 100);
                prop_assert_eq!(once.credits, 100 - ask.min(used));
                Ok(())
            })?;
        }
    }
}
