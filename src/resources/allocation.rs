use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::pool::ResourcePool;

/// Unique identifier for an [`Allocation`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationId(pub Uuid);

impl AllocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AllocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Level of a lease in the swarm → run → step hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationLevel {
    Swarm,
    Run,
    Step,
}

impl fmt::Display for AllocationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationLevel::Swarm => write!(f, "swarm"),
            AllocationLevel::Run => write!(f, "run"),
            AllocationLevel::Step => write!(f, "step"),
        }
    }
}

/// Lifecycle of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    /// Granted and not yet settled
    Active,
    /// Returned by its holder with actual usage
    Released,
    /// Expired and credited back by the sweep or a lazy read
    Reclaimed,
}

/// A time-bounded, quantity-bounded grant of resources from a parent pool.
///
/// # Invariants
///
/// - `remaining` never exceeds `allocated` in any component.
/// - A child's `allocated` was debited from the parent's `remaining` at grant time.
/// - `reclaimed` flips to true at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,

    /// Swarm, run or step identifier that holds the lease
    pub owner_id: String,

    /// Parent lease, `None` for swarm pools
    pub parent_id: Option<AllocationId>,

    pub level: AllocationLevel,

    /// Amount granted from the parent
    pub allocated: ResourcePool,

    /// Amount not yet handed to children
    pub remaining: ResourcePool,

    pub allocated_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    pub status: AllocationStatus,

    /// One-shot flag set when an expired lease is credited back
    pub reclaimed: bool,

    /// Frozen leases may not issue new children
    pub frozen: bool,

    /// Usage reported on release
    pub usage: Option<ResourcePool>,
}

impl Allocation {
    /// True when the lease is active and its deadline has passed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == AllocationStatus::Active && self.expires_at <= now
    }

    pub fn is_active(&self) -> bool {
        self.status == AllocationStatus::Active
    }

    /// Milliseconds left before expiry, floored at zero
    pub fn time_left_ms(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_milliseconds().max(0) as u64
    }
}

/// A request for a child lease
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Identifier of the run or step that will hold the lease
    pub owner_id: String,

    /// Minimum the parent must be able to cover
    pub estimated: ResourcePool,

    /// Amount to reserve pessimistically; defaults to `estimated`
    #[serde(default)]
    pub reservation: Option<ResourcePool>,

    /// Requested lifetime of the lease
    pub duration_ms: u64,
}

impl AllocationRequest {
    pub fn new(owner_id: impl Into<String>, estimated: ResourcePool, duration_ms: u64) -> Self {
        Self {
            owner_id: owner_id.into(),
            estimated,
            reservation: None,
            duration_ms,
        }
    }

    pub fn with_reservation(mut self, reservation: ResourcePool) -> Self {
        self.reservation = Some(reservation);
        self
    }
}

/// Result of settling a lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseOutcome {
    /// First release; `credited` went back to the parent
    Released { credited: ResourcePool },
    /// The lease was already released or reclaimed; nothing changed
    AlreadySettled,
}
