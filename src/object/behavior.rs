// ============================================================================
// Behavior Resolution
// ============================================================================
//
// An operation on a handle first resolves how the calling transaction
// relates to the object, once, from
//   (persistence state, overlay, calling coordinator)
// and then matches on the result.
//
// ============================================================================

use std::sync::Arc;

use super::TransactionOverlay;
use crate::core::PersistenceState;
use crate::transaction::{Coordinator, CoordinatorId};

#[derive(Debug, Clone)]
pub enum Behavior {
    /// Committed state is deleted; nothing but reads of history may proceed
    Deleted,

    /// No transaction: plain reads of the committed snapshot
    NoTransaction,

    /// Caller is not enrolled and no foreign writer blocks it; `readers`
    /// are the coordinators holding shared claims
    Unenrolled { readers: Vec<CoordinatorId> },

    /// Caller holds a shared claim; `sole` when nobody else does
    Reader { sole: bool },

    /// Caller holds the exclusive claim
    Writer { overlay: Arc<TransactionOverlay> },

    /// Another coordinator holds the exclusive claim
    ForeignWriter { blocker: Arc<Coordinator> },
}

impl Behavior {
    pub fn resolve(
        state: PersistenceState,
        overlay: Option<Arc<TransactionOverlay>>,
        caller: Option<CoordinatorId>,
    ) -> Self {
        let Some(caller) = caller else {
            return if state.is_deleted() {
                Behavior::Deleted
            } else {
                Behavior::NoTransaction
            };
        };

        match overlay {
            Some(overlay) if overlay.is_writer(caller) => Behavior::Writer { overlay },
            Some(overlay) if overlay.is_participant(caller) => Behavior::Reader {
                sole: overlay.is_sole_reader(caller),
            },
            Some(overlay) => match overlay.writer() {
                Some(writer) => Behavior::ForeignWriter {
                    blocker: Arc::clone(writer),
                },
                None if state.is_deleted() => Behavior::Deleted,
                None => Behavior::Unenrolled {
                    readers: overlay.readers().iter().map(|r| r.id()).collect(),
                },
            },
            None if state.is_deleted() => Behavior::Deleted,
            None => Behavior::Unenrolled { readers: Vec::new() },
        }
    }
}

/// Result of one compare-and-set enrollment attempt
#[derive(Debug)]
pub(crate) enum Attempt {
    Installed,
    AlreadyEnrolled,
    Blocked(Arc<Coordinator>),
    ReadersActive(Vec<CoordinatorId>),
    /// Another thread changed the overlay first; try again
    Lost,
}
