use std::sync::Arc;

use log::debug;

use crate::cache::{InMemoryObjectIndex, ObjectIndex, PerClassUpdateCountHolder, TemporalWindowTracker};
use crate::config::CacheConfig;
use crate::core::{BusinessDate, CacheError, DataSnapshot, PrimaryKey, Result, ValidityWindow, Value};
use crate::object::{PersistentHandle, TemporalPolicy, TypeContext};
use crate::storage::PersistenceGateway;

/// Repository of one business type.
///
/// Owns the identity index, the store gateway, the type's update counter
/// and, for dated types, the window tracker. `find` resolves from the index
/// first and materializes from the store otherwise.
pub struct ObjectType<P: TemporalPolicy> {
    index: Arc<InMemoryObjectIndex<P>>,
    context: Arc<TypeContext<P>>,
}

impl<P: TemporalPolicy> ObjectType<P> {
    pub fn new(
        name: &str,
        gateway: Arc<dyn PersistenceGateway>,
        update_count: Arc<PerClassUpdateCountHolder>,
        config: &CacheConfig,
        indexed_attributes: &[&str],
    ) -> Self {
        let index = Arc::new(InMemoryObjectIndex::with_indexed_attributes(indexed_attributes));
        let dyn_index: Arc<dyn ObjectIndex<P>> = index.clone();
        let context = Arc::new(TypeContext::new(
            name,
            gateway,
            update_count,
            Arc::new(TemporalWindowTracker::new()),
            &dyn_index,
            config.cas_attempts,
        ));
        Self { index, context }
    }

    pub fn name(&self) -> &str {
        self.context.name()
    }

    pub fn is_dated(&self) -> bool {
        P::DATED
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        self.context.gateway()
    }

    pub fn update_count(&self) -> &Arc<PerClassUpdateCountHolder> {
        self.context.update_count()
    }

    pub fn tracker(&self) -> &Arc<TemporalWindowTracker> {
        self.context.tracker()
    }

    /// Handle for `key`: the indexed one, or a fresh one read from the store.
    pub fn find(&self, key: impl Into<PrimaryKey>) -> Result<Arc<PersistentHandle<P>>> {
        let key = key.into();
        if let Some(handle) = self.live_handle(&key) {
            return Ok(handle);
        }
        self.materialize(&key, None)
    }

    /// Handle for `key` whose committed data is authoritative at `date`.
    ///
    /// One handle per key is kept; it is moved to the window containing
    /// `date` when needed.
    pub fn find_as_of(&self, key: impl Into<PrimaryKey>, date: BusinessDate) -> Result<Arc<PersistentHandle<P>>> {
        let key = key.into();
        let handle = match self.live_handle(&key) {
            Some(handle) => handle,
            None => self.materialize(&key, Some(date))?,
        };
        handle.read_as_of(date)?;
        Ok(handle)
    }

    /// Matching handles whose committed `attribute` equals `value`.
    ///
    /// `None` when `attribute` carries no secondary index. Only objects
    /// already materialized are considered.
    pub fn find_by(&self, attribute: &str, value: &Value) -> Option<Vec<Arc<PersistentHandle<P>>>> {
        let keys = self.index.keys_by(attribute, value)?;
        Some(keys.iter().filter_map(|key| self.index.resolve(key)).collect())
    }

    /// New in-memory object; it becomes persistent once inserted.
    pub fn create(&self, snapshot: DataSnapshot) -> Result<Arc<PersistentHandle<P>>> {
        if P::DATED && snapshot.window().is_none() {
            return Err(CacheError::InvariantViolation(format!(
                "dated {}[{}] needs a validity window",
                self.name(),
                snapshot.key()
            )));
        }
        if self.live_handle(snapshot.key()).is_some() {
            return Err(CacheError::DuplicateKey(format!("{}[{}]", self.name(), snapshot.key())));
        }
        Ok(PersistentHandle::in_memory(Arc::clone(&self.context), snapshot))
    }

    /// New dated object valid from `from` on.
    pub fn create_as_of(&self, snapshot: DataSnapshot, from: BusinessDate) -> Result<Arc<PersistentHandle<P>>> {
        self.create(snapshot.with_window(ValidityWindow::open_from(from)?))
    }

    /// Mark every cached object of this type stale.
    pub fn invalidate(&self) -> u64 {
        let token = self.update_count().bump();
        debug!("{} invalidated at update count {}", self.name(), token);
        token
    }

    pub fn handles(&self) -> Vec<Arc<PersistentHandle<P>>> {
        self.index.handles()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn live_handle(&self, key: &PrimaryKey) -> Option<Arc<PersistentHandle<P>>> {
        self.index
            .resolve(key)
            .filter(|handle| !handle.persistence_state().is_deleted())
    }

    fn materialize(&self, key: &PrimaryKey, as_of: Option<BusinessDate>) -> Result<Arc<PersistentHandle<P>>> {
        // token first: a commit racing the fetch leaves the handle stale
        let token = self.update_count().current_count();
        let row = P::fetch(self.gateway().as_ref(), key, as_of)?
            .ok_or_else(|| CacheError::NotFound(format!("{}[{}]", self.name(), key)))?
            .with_data_version(token);

        if P::DATED {
            self.tracker().reconcile(key, Arc::new(row.clone()))?;
        }
        let handle = PersistentHandle::materialize(Arc::clone(&self.context), row);
        Ok(self.index.register(handle))
    }
}

impl<P: TemporalPolicy> std::fmt::Debug for ObjectType<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectType")
            .field("name", &self.name())
            .field("dated", &P::DATED)
            .field("cached", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Dated, NonDated};
    use crate::storage::InMemoryStore;
    use chrono::{TimeZone, Utc};

    fn orders(store: &Arc<InMemoryStore>) -> ObjectType<NonDated> {
        ObjectType::new(
            "order",
            store.clone(),
            Arc::new(PerClassUpdateCountHolder::new()),
            &CacheConfig::default(),
            &["status"],
        )
    }

    #[test]
    fn test_find_is_an_identity_map() {
        let store = InMemoryStore::new("order");
        store
            .put_external(DataSnapshot::new(PrimaryKey::from(1)).with_attribute("status", "open"))
            .unwrap();
        let orders = orders(&store);

        let first = orders.find(1).unwrap();
        let second = orders.find(1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.stats().fetches, 1);
        assert!(matches!(orders.find(2), Err(CacheError::NotFound(_))));
    }

    #[test]
    fn test_find_by_secondary_index() {
        let store = InMemoryStore::new("order");
        for id in 1..=3 {
            let status = if id == 2 { "closed" } else { "open" };
            store
                .put_external(DataSnapshot::new(PrimaryKey::from(id)).with_attribute("status", status))
                .unwrap();
        }
        let orders = orders(&store);
        for id in 1..=3 {
            orders.find(id).unwrap();
        }

        let open = orders.find_by("status", &Value::from("open")).unwrap();
        assert_eq!(open.len(), 2);
        assert!(orders.find_by("customer", &Value::from("x")).is_none());
    }

    #[test]
    fn test_create_rejects_duplicates_and_missing_windows() {
        let store = InMemoryStore::new("order");
        store.put_external(DataSnapshot::new(PrimaryKey::from(1))).unwrap();
        let orders = orders(&store);
        orders.find(1).unwrap();

        assert!(matches!(
            orders.create(DataSnapshot::new(PrimaryKey::from(1))),
            Err(CacheError::DuplicateKey(_))
        ));

        let dated_store = InMemoryStore::dated("price");
        let prices: ObjectType<Dated> = ObjectType::new(
            "price",
            dated_store,
            Arc::new(PerClassUpdateCountHolder::new()),
            &CacheConfig::default(),
            &[],
        );
        assert!(prices.create(DataSnapshot::new(PrimaryKey::from(1))).is_err());
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(prices.create_as_of(DataSnapshot::new(PrimaryKey::from(1)), from).is_ok());
    }
}
