// ============================================================================
// Coordinator State
// ============================================================================
//
// Identity and lifecycle of a coordinator (one logical transaction):
//
//   Active ──commit──> Committing ──> Committed
//     │
//     └──rollback──> RollingBack ──> RolledBack
//
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Global coordinator ID counter
static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoordinatorId(pub u64);

impl CoordinatorId {
    /// Generate a new unique coordinator ID
    pub fn new() -> Self {
        CoordinatorId(NEXT_COORDINATOR_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for CoordinatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CoordinatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    /// Can enroll objects
    Active,

    /// Flushing and reconciling enrolled objects
    Committing,

    Committed,

    RollingBack,

    RolledBack,
}

impl CoordinatorStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, CoordinatorStatus::Active)
    }

    /// No further transitions; waiters may proceed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CoordinatorStatus::Committed | CoordinatorStatus::RolledBack
        )
    }
}

impl std::fmt::Display for CoordinatorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorStatus::Active => write!(f, "ACTIVE"),
            CoordinatorStatus::Committing => write!(f, "COMMITTING"),
            CoordinatorStatus::Committed => write!(f, "COMMITTED"),
            CoordinatorStatus::RollingBack => write!(f, "ROLLING_BACK"),
            CoordinatorStatus::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// How transactional reads take part in a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationMode {
    /// Reads enroll the object for shared read, holding writers off until
    /// the reader finishes
    ReadLocked,

    /// Reads never enroll; conflicting writes surface as version mismatches
    OptimisticLocking,
}

impl ParticipationMode {
    pub fn locks_reads(&self) -> bool {
        matches!(self, ParticipationMode::ReadLocked)
    }
}

impl std::fmt::Display for ParticipationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParticipationMode::ReadLocked => write!(f, "READ_LOCKED"),
            ParticipationMode::OptimisticLocking => write!(f, "OPTIMISTIC_LOCKING"),
        }
    }
}
