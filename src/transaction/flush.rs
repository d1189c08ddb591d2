// ============================================================================
// Flush Batch
// ============================================================================
//
// Writes a coordinator collects during its flush pass, grouped per gateway.
// Each group is applied by its gateway as one all-or-nothing batch. When a
// later group fails, the groups already applied are restored from the row
// images their gateways returned, newest first.
//
// ============================================================================

use std::sync::Arc;

use log::{debug, error};

use crate::cache::PerClassUpdateCountHolder;
use crate::core::{CacheError, Result};
use crate::storage::{PersistenceGateway, RowImage, StoreWrite};

struct FlushGroup {
    gateway: Arc<dyn PersistenceGateway>,
    update_count: Arc<PerClassUpdateCountHolder>,
    writes: Vec<StoreWrite>,
}

#[derive(Default)]
pub struct FlushBatch {
    groups: Vec<FlushGroup>,
}

impl FlushBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `write` for `gateway`. `update_count` is bumped when the
    /// gateway rejects the batch as stale.
    pub fn push(
        &mut self,
        gateway: &Arc<dyn PersistenceGateway>,
        update_count: &Arc<PerClassUpdateCountHolder>,
        write: StoreWrite,
    ) {
        let existing = self
            .groups
            .iter_mut()
            .find(|g| std::ptr::addr_eq(Arc::as_ptr(&g.gateway), Arc::as_ptr(gateway)));
        match existing {
            Some(group) => group.writes.push(write),
            None => self.groups.push(FlushGroup {
                gateway: Arc::clone(gateway),
                update_count: Arc::clone(update_count),
                writes: vec![write],
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.writes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Apply every group, or leave every gateway as it was.
    pub fn apply(self) -> Result<()> {
        let mut applied: Vec<(Arc<dyn PersistenceGateway>, Vec<RowImage>)> = Vec::new();

        for group in self.groups {
            match group.gateway.apply_batch(&group.writes) {
                Ok(images) => applied.push((group.gateway, images)),
                Err(err) => {
                    if matches!(err, CacheError::OptimisticLockFailure { .. }) {
                        // cached copies are behind the store: make readers re-fetch
                        group.update_count.bump();
                    }
                    for (gateway, images) in applied.iter().rev() {
                        if let Err(restore_err) = gateway.restore(images) {
                            error!("restoring {} rows failed: {}", images.len(), restore_err);
                        }
                    }
                    debug!("flush rejected after {} applied groups: {}", applied.len(), err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FlushBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushBatch")
            .field("gateways", &self.groups.len())
            .field("writes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataSnapshot, PrimaryKey};
    use crate::storage::InMemoryStore;

    fn row(id: i64, qty: i64) -> DataSnapshot {
        DataSnapshot::new(PrimaryKey::from(id)).with_attribute("qty", qty)
    }

    #[test]
    fn test_writes_group_per_gateway() {
        let orders: Arc<dyn PersistenceGateway> = InMemoryStore::new("order");
        let lines: Arc<dyn PersistenceGateway> = InMemoryStore::new("line");
        let counter = Arc::new(PerClassUpdateCountHolder::new());

        let mut batch = FlushBatch::new();
        assert!(batch.is_empty());
        batch.push(&orders, &counter, StoreWrite::Insert(row(1, 1).with_version(1)));
        batch.push(&lines, &counter, StoreWrite::Insert(row(1, 1).with_version(1)));
        batch.push(&orders, &counter, StoreWrite::Insert(row(2, 1).with_version(1)));

        assert_eq!(batch.groups.len(), 2);
        assert_eq!(batch.len(), 3);
        batch.apply().unwrap();
        assert!(orders.fetch(&PrimaryKey::from(2)).unwrap().is_some());
    }

    #[test]
    fn test_later_gateway_failure_restores_earlier_ones() {
        let orders = InMemoryStore::new("order");
        let lines = InMemoryStore::new("line");
        orders.put_external(row(1, 5)).unwrap();
        lines.put_external(row(1, 5)).unwrap();
        lines.put_external(row(1, 6)).unwrap();

        let order_gateway: Arc<dyn PersistenceGateway> = orders.clone();
        let line_gateway: Arc<dyn PersistenceGateway> = lines.clone();
        let order_count = Arc::new(PerClassUpdateCountHolder::new());
        let line_count = Arc::new(PerClassUpdateCountHolder::new());

        let mut batch = FlushBatch::new();
        batch.push(
            &order_gateway,
            &order_count,
            StoreWrite::Update {
                row: row(1, 99).with_version(2),
                expected_version: 1,
            },
        );
        batch.push(
            &line_gateway,
            &line_count,
            StoreWrite::Update {
                row: row(1, 99).with_version(2),
                expected_version: 1,
            },
        );

        assert!(matches!(
            batch.apply(),
            Err(CacheError::OptimisticLockFailure { .. })
        ));
        let order = orders.row(&PrimaryKey::from(1)).unwrap();
        assert_eq!(order.version(), 1);
        assert_eq!(order.get("qty").and_then(|v| v.as_i64()), Some(5));
        assert_eq!(line_count.current_count(), 1);
        assert_eq!(order_count.current_count(), 0);
    }
}
