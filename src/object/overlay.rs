use std::sync::Arc;

use crate::core::{DataSnapshot, PersistenceState};
use crate::transaction::{Coordinator, CoordinatorId};

/// Who holds an object right now
#[derive(Debug, Clone)]
pub enum Claim {
    /// One or more coordinators reading the committed snapshot
    Shared(Vec<Arc<Coordinator>>),

    /// A single writer and its private working copy
    Exclusive {
        writer: Arc<Coordinator>,
        working: Arc<DataSnapshot>,
    },
}

/// Immutable record of the transactional claims on one object.
///
/// Every change produces a new overlay that is installed with
/// compare-and-set; an overlay with no participants is never installed.
#[derive(Debug, Clone)]
pub struct TransactionOverlay {
    claim: Claim,
    target_state: PersistenceState,
}

impl TransactionOverlay {
    pub fn shared(reader: Arc<Coordinator>, state: PersistenceState) -> Self {
        Self {
            claim: Claim::Shared(vec![reader]),
            target_state: state,
        }
    }

    pub fn exclusive(
        writer: Arc<Coordinator>,
        working: DataSnapshot,
        state: PersistenceState,
    ) -> Self {
        Self {
            claim: Claim::Exclusive {
                writer,
                working: Arc::new(working),
            },
            target_state: state,
        }
    }

    pub fn claim(&self) -> &Claim {
        &self.claim
    }

    pub fn target_state(&self) -> PersistenceState {
        self.target_state
    }

    pub fn writer(&self) -> Option<&Arc<Coordinator>> {
        match &self.claim {
            Claim::Exclusive { writer, .. } => Some(writer),
            Claim::Shared(_) => None,
        }
    }

    pub fn readers(&self) -> &[Arc<Coordinator>] {
        match &self.claim {
            Claim::Shared(readers) => readers,
            Claim::Exclusive { .. } => &[],
        }
    }

    pub fn working(&self) -> Option<&Arc<DataSnapshot>> {
        match &self.claim {
            Claim::Exclusive { working, .. } => Some(working),
            Claim::Shared(_) => None,
        }
    }

    pub fn is_writer(&self, id: CoordinatorId) -> bool {
        self.writer().is_some_and(|w| w.id() == id)
    }

    pub fn is_participant(&self, id: CoordinatorId) -> bool {
        match &self.claim {
            Claim::Exclusive { writer, .. } => writer.id() == id,
            Claim::Shared(readers) => readers.iter().any(|r| r.id() == id),
        }
    }

    /// The only participant is the reader `id`
    pub fn is_sole_reader(&self, id: CoordinatorId) -> bool {
        matches!(&self.claim, Claim::Shared(readers) if readers.len() == 1 && readers[0].id() == id)
    }

    pub fn foreign_participants(&self, id: CoordinatorId) -> Vec<Arc<Coordinator>> {
        match &self.claim {
            Claim::Exclusive { writer, .. } if writer.id() != id => vec![Arc::clone(writer)],
            Claim::Exclusive { .. } => Vec::new(),
            Claim::Shared(readers) => readers
                .iter()
                .filter(|r| r.id() != id)
                .map(Arc::clone)
                .collect(),
        }
    }

    /// Copy with `reader` added to the shared claim.
    pub fn with_reader(&self, reader: Arc<Coordinator>) -> Option<Self> {
        match &self.claim {
            Claim::Shared(readers) => {
                let mut readers = readers.clone();
                readers.push(reader);
                Some(Self {
                    claim: Claim::Shared(readers),
                    target_state: self.target_state,
                })
            }
            Claim::Exclusive { .. } => None,
        }
    }

    /// Copy without participant `id`; `None` when nobody is left.
    pub fn without(&self, id: CoordinatorId) -> Option<Self> {
        match &self.claim {
            Claim::Exclusive { writer, .. } if writer.id() == id => None,
            Claim::Exclusive { .. } => Some(self.clone()),
            Claim::Shared(readers) => {
                let remaining: Vec<_> = readers
                    .iter()
                    .filter(|r| r.id() != id)
                    .map(Arc::clone)
                    .collect();
                if remaining.is_empty() {
                    None
                } else {
                    Some(Self {
                        claim: Claim::Shared(remaining),
                        target_state: self.target_state,
                    })
                }
            }
        }
    }

    /// Copy carrying a new working snapshot; only valid for exclusive claims.
    pub fn with_working(&self, working: DataSnapshot) -> Option<Self> {
        match &self.claim {
            Claim::Exclusive { writer, .. } => Some(Self {
                claim: Claim::Exclusive {
                    writer: Arc::clone(writer),
                    working: Arc::new(working),
                },
                target_state: self.target_state,
            }),
            Claim::Shared(_) => None,
        }
    }

    pub fn with_target_state(&self, state: PersistenceState) -> Self {
        Self {
            claim: self.claim.clone(),
            target_state: state,
        }
    }
}
