use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Add;

/// A vector of resource quantities held by a lease.
///
/// All quantities are integral so that debits and credits are exact.
/// `steps` only has meaning for run-level pools, where it caps the number
/// of step leases a run may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourcePool {
    /// Compute credits
    #[serde(default)]
    pub credits: u64,

    /// Elapsed-time budget in milliseconds
    #[serde(default)]
    pub time_ms: u64,

    /// Memory budget in megabytes
    #[serde(default)]
    pub memory_mb: u64,

    /// Maximum number of steps
    #[serde(default)]
    pub steps: u64,
}

impl ResourcePool {
    /// Create a pool with every quantity set
    pub fn new(credits: u64, time_ms: u64, memory_mb: u64, steps: u64) -> Self {
        Self {
            credits,
            time_ms,
            memory_mb,
            steps,
        }
    }

    /// Pool holding only credits
    pub fn credits(credits: u64) -> Self {
        Self {
            credits,
            ..Self::default()
        }
    }

    pub fn with_time_ms(mut self, time_ms: u64) -> Self {
        self.time_ms = time_ms;
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_steps(mut self, steps: u64) -> Self {
        self.steps = steps;
        self
    }

    /// True when every quantity is zero
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// True when this pool has at least as much of every quantity as `other`
    pub fn covers(&self, other: &ResourcePool) -> bool {
        self.credits >= other.credits
            && self.time_ms >= other.time_ms
            && self.memory_mb >= other.memory_mb
            && self.steps >= other.steps
    }

    /// Component-wise subtraction, `None` if any component would go negative
    pub fn checked_sub(&self, other: &ResourcePool) -> Option<ResourcePool> {
        Some(ResourcePool {
            credits: self.credits.checked_sub(other.credits)?,
            time_ms: self.time_ms.checked_sub(other.time_ms)?,
            memory_mb: self.memory_mb.checked_sub(other.memory_mb)?,
            steps: self.steps.checked_sub(other.steps)?,
        })
    }

    /// Component-wise subtraction floored at zero
    pub fn saturating_sub(&self, other: &ResourcePool) -> ResourcePool {
        ResourcePool {
            credits: self.credits.saturating_sub(other.credits),
            time_ms: self.time_ms.saturating_sub(other.time_ms),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            steps: self.steps.saturating_sub(other.steps),
        }
    }

    /// Component-wise addition, `None` on overflow
    pub fn checked_add(&self, other: &ResourcePool) -> Option<ResourcePool> {
        Some(ResourcePool {
            credits: self.credits.checked_add(other.credits)?,
            time_ms: self.time_ms.checked_add(other.time_ms)?,
            memory_mb: self.memory_mb.checked_add(other.memory_mb)?,
            steps: self.steps.checked_add(other.steps)?,
        })
    }

    /// Component-wise minimum
    pub fn min(&self, other: &ResourcePool) -> ResourcePool {
        ResourcePool {
            credits: self.credits.min(other.credits),
            time_ms: self.time_ms.min(other.time_ms),
            memory_mb: self.memory_mb.min(other.memory_mb),
            steps: self.steps.min(other.steps),
        }
    }

    /// Component-wise maximum
    pub fn max(&self, other: &ResourcePool) -> ResourcePool {
        ResourcePool {
            credits: self.credits.max(other.credits),
            time_ms: self.time_ms.max(other.time_ms),
            memory_mb: self.memory_mb.max(other.memory_mb),
            steps: self.steps.max(other.steps),
        }
    }
}

impl Add for ResourcePool {
    type Output = ResourcePool;

    fn add(self, other: ResourcePool) -> ResourcePool {
        ResourcePool {
            credits: self.credits.saturating_add(other.credits),
            time_ms: self.time_ms.saturating_add(other.time_ms),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            steps: self.steps.saturating_add(other.steps),
        }
    }
}

impl fmt::Display for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "credits={} time={}ms memory={}MB steps={}",
            self.credits, self.time_ms, self.memory_mb, self.steps
        )
    }
}
