// ============================================================================
// txcache Library
// ============================================================================
//
// In-process transactional object cache. Every business object is a
// long-lived handle with a committed snapshot and an overlay of
// transactional claims; transactions enroll through compare-and-set, flush
// their writes through a persistence gateway and publish on commit.
//
// ============================================================================

pub mod cache;
pub mod config;
pub mod core;
pub mod facade;
pub mod object;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use cache::{InMemoryObjectIndex, ObjectIndex, PerClassUpdateCountHolder, TemporalWindowTracker};
pub use config::CacheConfig;
pub use core::{
    BusinessDate, CacheError, DataSnapshot, INFINITY, PersistenceState, PrimaryKey, Result,
    ValidityWindow, Value,
};
pub use facade::{CacheManager, ObjectType};
pub use object::{Behavior, Dated, DetachedObject, NonDated, PersistentHandle, TemporalPolicy};
pub use storage::{InMemoryStore, PersistenceGateway, RowImage, StoreWrite};
pub use transaction::{
    Coordinator, CoordinatorId, CoordinatorStatus, FlushBatch, ParticipationMode, Transaction,
    TransactionManager, TransactionalObject,
};

/// Handle of a plain business object
pub type Handle = PersistentHandle<NonDated>;

/// Handle of a dated business object
pub type DatedHandle = PersistentHandle<Dated>;
