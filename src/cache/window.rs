use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::core::{BusinessDate, CacheError, DataSnapshot, PrimaryKey, Result, ValidityWindow};

pub(crate) type History = BTreeMap<BusinessDate, Arc<DataSnapshot>>;

/// Insert `snapshot` into one key's history, keeping windows disjoint.
///
/// A window starting at the same date is replaced; any other window it
/// overlaps is trimmed, or split in two when it covers both ends.
pub(crate) fn splice(history: &mut History, snapshot: Arc<DataSnapshot>) -> Result<()> {
    let window = *snapshot.window().ok_or_else(|| {
        CacheError::InvariantViolation(format!(
            "snapshot of {} has no validity window",
            snapshot.key()
        ))
    })?;
    history.remove(&window.from());

    let overlapped: Vec<BusinessDate> = history
        .range(..window.thru())
        .filter(|(_, s)| s.window().is_some_and(|w| w.overlaps(&window)))
        .map(|(from, _)| *from)
        .collect();

    for from in overlapped {
        let Some(existing) = history.remove(&from) else {
            continue;
        };
        let Some(old) = existing.window().copied() else {
            continue;
        };
        if old.from() < window.from() {
            let head = ValidityWindow::new(old.from(), window.from())?;
            history.insert(head.from(), Arc::new((*existing).clone().with_window(head)));
        }
        if old.thru() > window.thru() {
            let tail = ValidityWindow::new(window.thru(), old.thru())?;
            history.insert(tail.from(), Arc::new((*existing).clone().with_window(tail)));
        }
    }

    history.insert(window.from(), snapshot);
    Ok(())
}

/// Known validity windows of dated objects, per primary key, ordered by
/// `from`. Windows of one key never overlap.
#[derive(Debug, Default)]
pub struct TemporalWindowTracker {
    windows: RwLock<HashMap<PrimaryKey, History>>,
}

impl TemporalWindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `snapshot` as the authoritative version over its window.
    pub fn reconcile(&self, key: &PrimaryKey, snapshot: Arc<DataSnapshot>) -> Result<()> {
        if snapshot.window().is_none() {
            return Err(CacheError::InvariantViolation(format!(
                "snapshot of {} has no validity window",
                key
            )));
        }
        let mut windows = self.windows.write()?;
        splice(windows.entry(key.clone()).or_default(), snapshot)
    }

    pub fn remove_window(&self, key: &PrimaryKey, from: BusinessDate) -> Result<Option<Arc<DataSnapshot>>> {
        let mut windows = self.windows.write()?;
        let Some(history) = windows.get_mut(key) else {
            return Ok(None);
        };
        let removed = history.remove(&from);
        if history.is_empty() {
            windows.remove(key);
        }
        Ok(removed)
    }

    /// Snapshot whose window contains `date`
    pub fn active_for(&self, key: &PrimaryKey, date: BusinessDate) -> Result<Option<Arc<DataSnapshot>>> {
        let windows = self.windows.read()?;
        Ok(windows
            .get(key)
            .and_then(|history| history.range(..=date).next_back())
            .filter(|(_, s)| s.is_valid_at(date))
            .map(|(_, s)| Arc::clone(s)))
    }

    pub fn windows_for(&self, key: &PrimaryKey) -> Result<Vec<ValidityWindow>> {
        let windows = self.windows.read()?;
        Ok(windows
            .get(key)
            .map(|history| history.values().filter_map(|s| s.window().copied()).collect())
            .unwrap_or_default())
    }

    pub fn snapshots_for(&self, key: &PrimaryKey) -> Result<Vec<Arc<DataSnapshot>>> {
        let windows = self.windows.read()?;
        Ok(windows
            .get(key)
            .map(|history| history.values().cloned().collect())
            .unwrap_or_default())
    }

    pub fn forget(&self, key: &PrimaryKey) -> Result<()> {
        self.windows.write()?.remove(key);
        Ok(())
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.read().map(|w| w.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{INFINITY, Value};
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> BusinessDate {
        Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
    }

    fn version(from: BusinessDate, thru: BusinessDate, price: i64) -> Arc<DataSnapshot> {
        Arc::new(
            DataSnapshot::new(PrimaryKey::from(1))
                .with_attribute("price", price)
                .with_window(ValidityWindow::new(from, thru).unwrap()),
        )
    }

    fn assert_ordered_and_disjoint(windows: &[ValidityWindow]) {
        for pair in windows.windows(2) {
            assert!(pair[0].from() < pair[1].from());
            assert!(pair[0].thru() <= pair[1].from());
        }
    }

    #[test]
    fn test_reconcile_splits_covering_window() {
        let tracker = TemporalWindowTracker::new();
        let key = PrimaryKey::from(1);
        tracker.reconcile(&key, version(day(1), *INFINITY, 10)).unwrap();
        tracker.reconcile(&key, version(day(5), day(10), 20)).unwrap();

        let windows = tracker.windows_for(&key).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], ValidityWindow::new(day(1), day(5)).unwrap());
        assert_eq!(windows[1], ValidityWindow::new(day(5), day(10)).unwrap());
        assert_eq!(windows[2], ValidityWindow::new(day(10), *INFINITY).unwrap());
        assert_ordered_and_disjoint(&windows);

        let middle = tracker.active_for(&key, day(7)).unwrap().unwrap();
        assert_eq!(middle.get("price"), Some(&Value::Integer(20)));
        let tail = tracker.active_for(&key, day(12)).unwrap().unwrap();
        assert_eq!(tail.get("price"), Some(&Value::Integer(10)));
    }

    #[test]
    fn test_reconcile_replaces_same_start() {
        let tracker = TemporalWindowTracker::new();
        let key = PrimaryKey::from(1);
        tracker.reconcile(&key, version(day(1), *INFINITY, 10)).unwrap();
        tracker.reconcile(&key, version(day(1), day(4), 10)).unwrap();

        assert_eq!(
            tracker.windows_for(&key).unwrap(),
            vec![ValidityWindow::new(day(1), day(4)).unwrap()]
        );
        assert!(tracker.active_for(&key, day(4)).unwrap().is_none());
    }

    #[test]
    fn test_reconcile_trims_neighbours() {
        let tracker = TemporalWindowTracker::new();
        let key = PrimaryKey::from(1);
        tracker.reconcile(&key, version(day(1), day(6), 1)).unwrap();
        tracker.reconcile(&key, version(day(6), day(12), 2)).unwrap();
        tracker.reconcile(&key, version(day(4), day(8), 3)).unwrap();

        let windows = tracker.windows_for(&key).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].thru(), day(4));
        assert_eq!(windows[2].from(), day(8));
        assert_ordered_and_disjoint(&windows);
    }

    #[test]
    fn test_remove_window() {
        let tracker = TemporalWindowTracker::new();
        let key = PrimaryKey::from(1);
        tracker.reconcile(&key, version(day(1), day(6), 1)).unwrap();

        assert!(tracker.remove_window(&key, day(1)).unwrap().is_some());
        assert!(tracker.windows_for(&key).unwrap().is_empty());
        assert_eq!(tracker.tracked_keys(), 0);
    }

    #[test]
    fn test_non_dated_snapshot_is_rejected() {
        let tracker = TemporalWindowTracker::new();
        let key = PrimaryKey::from(1);
        let plain = Arc::new(DataSnapshot::new(key.clone()));
        assert!(matches!(
            tracker.reconcile(&key, plain),
            Err(CacheError::InvariantViolation(_))
        ));
    }
}
