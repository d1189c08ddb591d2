// ============================================================================
// Enlistment
// ============================================================================
//
// A coordinator keeps one enlistment per object it touched. At commit the
// coordinator replays them in two passes: flush (write enlistments queue
// their store writes, applied as one batch), then reconcile every object.
// Rollback only reconciles.
//
// ============================================================================

use std::sync::Arc;

use super::{Coordinator, FlushBatch};
use crate::core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollMode {
    Read,
    Write,
}

/// Callback surface a coordinator drives at transaction end
pub trait TransactionalObject: Send + Sync {
    /// Human readable identity, e.g. `order[7]`
    fn describe(&self) -> String;

    /// Queue the pending changes of `coordinator` for the backing store.
    fn flush(&self, coordinator: &Coordinator, batch: &mut FlushBatch) -> Result<()>;

    /// Publish the working copy of `coordinator` and drop its claim.
    fn commit(&self, coordinator: &Coordinator);

    /// Drop the claim of `coordinator` without publishing anything.
    fn rollback(&self, coordinator: &Coordinator);
}

#[derive(Clone)]
pub struct Enlistment {
    pub object: Arc<dyn TransactionalObject>,
    pub mode: EnrollMode,
}

impl Enlistment {
    pub fn new(object: Arc<dyn TransactionalObject>, mode: EnrollMode) -> Self {
        Self { object, mode }
    }

    pub fn is_write(&self) -> bool {
        self.mode == EnrollMode::Write
    }

    /// Identity comparison on the enlisted object
    pub fn refers_to(&self, object: &Arc<dyn TransactionalObject>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.object), Arc::as_ptr(object))
    }
}

impl std::fmt::Debug for Enlistment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enlistment")
            .field("object", &self.object.describe())
            .field("mode", &self.mode)
            .finish()
    }
}
