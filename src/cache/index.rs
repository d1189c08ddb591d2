use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::core::{DataSnapshot, PrimaryKey, Value};
use crate::object::{PersistentHandle, TemporalPolicy};

/// Identity map of one business type.
///
/// Commit reconciles into the index: inserts register the handle, deletes
/// remove it and updates give secondary indices a chance to follow the
/// changed attributes.
pub trait ObjectIndex<P: TemporalPolicy>: Send + Sync {
    fn resolve(&self, key: &PrimaryKey) -> Option<Arc<PersistentHandle<P>>>;

    /// Register `handle` and return the canonical handle for its key. A live
    /// handle already registered for the key wins.
    fn register(&self, handle: Arc<PersistentHandle<P>>) -> Arc<PersistentHandle<P>>;

    /// Unlink `handle`; a different handle registered under the same key is
    /// left alone.
    fn remove(&self, handle: &PersistentHandle<P>) -> bool;

    fn reindex_on_change(&self, handle: &PersistentHandle<P>, old: &DataSnapshot, new: &DataSnapshot);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Secondary = HashMap<Value, HashSet<PrimaryKey>>;

/// Hash-map identity index with optional secondary indices on attributes
pub struct InMemoryObjectIndex<P: TemporalPolicy> {
    handles: RwLock<HashMap<PrimaryKey, Arc<PersistentHandle<P>>>>,
    secondary: RwLock<HashMap<String, Secondary>>,
}

impl<P: TemporalPolicy> InMemoryObjectIndex<P> {
    pub fn new() -> Self {
        Self::with_indexed_attributes(&[])
    }

    pub fn with_indexed_attributes(attributes: &[&str]) -> Self {
        let secondary = attributes
            .iter()
            .map(|name| (name.to_string(), Secondary::new()))
            .collect();
        Self {
            handles: RwLock::new(HashMap::new()),
            secondary: RwLock::new(secondary),
        }
    }

    /// Keys of registered handles whose committed `attribute` equals `value`
    pub fn keys_by(&self, attribute: &str, value: &Value) -> Option<Vec<PrimaryKey>> {
        let secondary = self.secondary.read().ok()?;
        let index = secondary.get(attribute)?;
        let mut keys: Vec<PrimaryKey> = index
            .get(value)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(keys)
    }

    pub fn handles(&self) -> Vec<Arc<PersistentHandle<P>>> {
        self.handles
            .read()
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default()
    }

    fn index_snapshot(&self, key: &PrimaryKey, snapshot: &DataSnapshot) {
        let Ok(mut secondary) = self.secondary.write() else {
            return;
        };
        for (attribute, index) in secondary.iter_mut() {
            if let Some(value) = snapshot.get(attribute) {
                index.entry(value.clone()).or_default().insert(key.clone());
            }
        }
    }

    fn unindex_snapshot(&self, key: &PrimaryKey, snapshot: &DataSnapshot) {
        let Ok(mut secondary) = self.secondary.write() else {
            return;
        };
        for (attribute, index) in secondary.iter_mut() {
            let Some(value) = snapshot.get(attribute) else {
                continue;
            };
            if let Some(keys) = index.get_mut(value) {
                keys.remove(key);
                if keys.is_empty() {
                    index.remove(value);
                }
            }
        }
    }
}

impl<P: TemporalPolicy> Default for InMemoryObjectIndex<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: TemporalPolicy> ObjectIndex<P> for InMemoryObjectIndex<P> {
    fn resolve(&self, key: &PrimaryKey) -> Option<Arc<PersistentHandle<P>>> {
        self.handles.read().ok()?.get(key).cloned()
    }

    fn register(&self, handle: Arc<PersistentHandle<P>>) -> Arc<PersistentHandle<P>> {
        let mut handles = match self.handles.write() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(existing) = handles.get(handle.key()) {
            if !Arc::ptr_eq(existing, &handle) && !existing.persistence_state().is_deleted() {
                return Arc::clone(existing);
            }
        }

        if let Some(previous) = handles.insert(handle.key().clone(), Arc::clone(&handle)) {
            if let Some(old) = previous.committed() {
                self.unindex_snapshot(previous.key(), &old);
            }
        }
        if let Some(snapshot) = handle.committed() {
            self.index_snapshot(handle.key(), &snapshot);
        }
        handle
    }

    fn remove(&self, handle: &PersistentHandle<P>) -> bool {
        let mut handles = match self.handles.write() {
            Ok(handles) => handles,
            Err(poisoned) => poisoned.into_inner(),
        };

        let registered = handles
            .get(handle.key())
            .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), handle));
        if !registered {
            return false;
        }

        handles.remove(handle.key());
        if let Some(snapshot) = handle.committed() {
            self.unindex_snapshot(handle.key(), &snapshot);
        }
        debug!("unlinked {} from the index", handle.describe());
        true
    }

    fn reindex_on_change(&self, handle: &PersistentHandle<P>, old: &DataSnapshot, new: &DataSnapshot) {
        self.unindex_snapshot(handle.key(), old);
        self.index_snapshot(handle.key(), new);
    }

    fn len(&self) -> usize {
        self.handles.read().map(|h| h.len()).unwrap_or(0)
    }
}
