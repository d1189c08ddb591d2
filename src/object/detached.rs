use serde::{Deserialize, Serialize};

use crate::core::{CacheError, DataSnapshot, PrimaryKey, Result, Value};

/// Owned copy of an object's committed data.
///
/// Edits stay local; apply them with
/// [`PersistentHandle::copy_attributes_from`](super::PersistentHandle::copy_attributes_from),
/// which under optimistic locking checks the version carried here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachedObject {
    origin: String,
    snapshot: DataSnapshot,
}

impl DetachedObject {
    pub fn new(origin: impl Into<String>, snapshot: DataSnapshot) -> Self {
        Self {
            origin: origin.into(),
            snapshot,
        }
    }

    /// `type[key]` of the handle this copy was taken from
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn key(&self) -> &PrimaryKey {
        self.snapshot.key()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version()
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.snapshot.get(attribute)
    }

    pub fn set(&mut self, attribute: &str, value: impl Into<Value>) -> &mut Self {
        self.snapshot.set(attribute, value);
        self
    }

    pub fn snapshot(&self) -> &DataSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> DataSnapshot {
        self.snapshot
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| CacheError::InvariantViolation(format!("cannot encode {}: {}", self.origin, e)))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CacheError::InvariantViolation(format!("cannot decode detached object: {}", e)))
    }
}
