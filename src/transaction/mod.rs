// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Coordinators own the objects a transaction enrolled and drive their
// commit/rollback. Conflicts between transactions are settled when objects
// are enrolled; commit only meets conflicts with writers outside the cache.
//
// - coordinator: lifecycle, two-pass commit, wait-for-finish
// - enlistment:  per-object callback surface
// - flush:       store writes of one commit, applied all-or-nothing
// - manager:     begin, diagnostics, bounded retry loop
//
// ============================================================================

pub mod coordinator;
pub mod enlistment;
pub mod flush;
pub mod manager;
pub mod state;

pub use coordinator::Coordinator;
pub use enlistment::{EnrollMode, Enlistment, TransactionalObject};
pub use flush::FlushBatch;
pub use manager::{Transaction, TransactionInfo, TransactionManager, TransactionStats};
pub use state::{CoordinatorId, CoordinatorStatus, ParticipationMode};
