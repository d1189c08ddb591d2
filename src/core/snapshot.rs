use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{BusinessDate, PrimaryKey, ValidityWindow, Value};

/// One version of a business row.
///
/// Snapshots are never mutated while another thread can see them: a writer
/// works on its own clone and publishes it by swapping a pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSnapshot {
    key: PrimaryKey,
    attributes: BTreeMap<String, Value>,
    /// Bumped by every commit that changed the row
    version: u64,
    /// Staleness token, compared against the per-type update counter
    #[serde(default)]
    data_version: u64,
    window: Option<ValidityWindow>,
}

impl DataSnapshot {
    pub fn new(key: PrimaryKey) -> Self {
        Self {
            key,
            attributes: BTreeMap::new(),
            version: 0,
            data_version: 0,
            window: None,
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_data_version(mut self, data_version: u64) -> Self {
        self.data_version = data_version;
        self
    }

    pub fn with_window(mut self, window: ValidityWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(name.into(), value.into())
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn data_version(&self) -> u64 {
        self.data_version
    }

    pub fn window(&self) -> Option<&ValidityWindow> {
        self.window.as_ref()
    }

    pub(crate) fn set_window(&mut self, window: ValidityWindow) {
        self.window = Some(window);
    }

    /// Overwrites every attribute with the values of `source`; key, version
    /// and window stay as they are.
    pub(crate) fn copy_attributes(&mut self, source: &DataSnapshot) {
        self.attributes = source.attributes.clone();
    }

    /// Whether any non-key attribute or the validity window differs.
    ///
    /// Version and staleness tokens are bookkeeping and ignored.
    pub fn changed(&self, other: &DataSnapshot) -> bool {
        self.attributes != other.attributes || self.window != other.window
    }

    /// Whether this snapshot is authoritative at `date`. Non-dated snapshots
    /// are valid at every date.
    pub fn is_valid_at(&self, date: BusinessDate) -> bool {
        self.window.map(|w| w.contains(date)).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_changed_ignores_bookkeeping() {
        let a = DataSnapshot::new(PrimaryKey::from(1))
            .with_attribute("qty", 5i64)
            .with_version(3);
        let b = a.clone().with_version(4).with_data_version(9);
        assert!(!a.changed(&b));

        let c = a.clone().with_attribute("qty", 6i64);
        assert!(a.changed(&c));
    }

    #[test]
    fn test_window_change_is_a_change() {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let thru = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let open = DataSnapshot::new(PrimaryKey::from(1))
            .with_window(ValidityWindow::open_from(from).unwrap());
        let closed = open
            .clone()
            .with_window(ValidityWindow::new(from, thru).unwrap());

        assert!(open.changed(&closed));
        assert!(open.is_valid_at(thru));
        assert!(!closed.is_valid_at(thru));
    }
}
