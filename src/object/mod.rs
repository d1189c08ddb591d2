// ============================================================================
// Object Module
// ============================================================================
//
// Per-object transactional state machine:
//
//   slot:     lock-free atomic reference to an immutable value
//   overlay:  shared or exclusive transactional claims
//   behavior: how a caller relates to an object right now
//   temporal: what differs between plain and dated objects
//   handle:   the persistent handle tying these together
//
// ============================================================================

pub mod behavior;
pub mod detached;
pub mod handle;
pub mod overlay;
pub mod slot;
pub mod temporal;

pub use behavior::Behavior;
pub use detached::DetachedObject;
pub use handle::{PersistentHandle, TypeContext};
pub use overlay::{Claim, TransactionOverlay};
pub use slot::AtomicSlot;
pub use temporal::{Dated, NonDated, TemporalPolicy, WindowEdit};
