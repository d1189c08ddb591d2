use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use super::{PersistenceGateway, RowImage, StoreWrite};
use crate::cache::window::{History, splice};
use crate::core::{BusinessDate, CacheError, DataSnapshot, PrimaryKey, Result};

/// Write counters of an [`InMemoryStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub fetches: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub terminates: u64,
}

#[derive(Default)]
struct StoreCounters {
    fetches: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    terminates: AtomicU64,
}

#[derive(Default)]
struct Rows {
    /// Non-dated rows
    current: HashMap<PrimaryKey, DataSnapshot>,
    /// Dated rows: live window history per key
    history: HashMap<PrimaryKey, History>,
    /// Dated rows: terminated windows, kept for audit
    retired: HashMap<PrimaryKey, Vec<DataSnapshot>>,
}

/// Backing store kept in process memory.
///
/// Stands in for the relational store: it enforces version checks on
/// writes, lets tests simulate writes by other processes and can fail the
/// next write on request.
pub struct InMemoryStore {
    name: String,
    dated: bool,
    rows: RwLock<Rows>,
    counters: StoreCounters,
    fail_next_write: AtomicBool,
}

impl InMemoryStore {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, false)
    }

    /// Store holding validity-window histories
    pub fn dated(name: &str) -> Arc<Self> {
        Self::build(name, true)
    }

    fn build(name: &str, dated: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            dated,
            rows: RwLock::new(Rows::default()),
            counters: StoreCounters::default(),
            fail_next_write: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dated(&self) -> bool {
        self.dated
    }

    /// Write a row the way another process would: bypassing the cache and
    /// bumping the stored version. Returns the version written.
    pub fn put_external(&self, snapshot: DataSnapshot) -> Result<u64> {
        let mut rows = self.rows.write()?;
        if self.dated {
            let from = self.window_start(&snapshot)?;
            let history = rows.history.entry(snapshot.key().clone()).or_default();
            let version = history
                .get(&from)
                .map(|row| row.version() + 1)
                .unwrap_or(snapshot.version().max(1));
            splice(history, Arc::new(snapshot.with_version(version)))?;
            Ok(version)
        } else {
            let version = rows
                .current
                .get(snapshot.key())
                .map(|row| row.version() + 1)
                .unwrap_or(snapshot.version().max(1));
            rows.current
                .insert(snapshot.key().clone(), snapshot.with_version(version));
            Ok(version)
        }
    }

    /// Remove every row of `key` behind the cache's back.
    pub fn remove_external(&self, key: &PrimaryKey) -> Result<bool> {
        let mut rows = self.rows.write()?;
        let removed = if self.dated {
            rows.retired.remove(key);
            rows.history.remove(key).is_some()
        } else {
            rows.current.remove(key).is_some()
        };
        Ok(removed)
    }

    /// Make the next single write of a batch fail with a persistence error.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub fn row(&self, key: &PrimaryKey) -> Option<DataSnapshot> {
        let rows = self.rows.read().ok()?;
        if self.dated {
            rows.history
                .get(key)
                .and_then(|h| h.values().next_back())
                .map(|row| (**row).clone())
        } else {
            rows.current.get(key).cloned()
        }
    }

    /// Stored windows of `key`, ordered by `from`
    pub fn history(&self, key: &PrimaryKey) -> Vec<DataSnapshot> {
        self.rows
            .read()
            .ok()
            .and_then(|rows| {
                rows.history
                    .get(key)
                    .map(|h| h.values().map(|row| (**row).clone()).collect())
            })
            .unwrap_or_default()
    }

    /// Terminated windows of `key`, in the order they were retired
    pub fn retired(&self, key: &PrimaryKey) -> Vec<DataSnapshot> {
        self.rows
            .read()
            .ok()
            .and_then(|rows| rows.retired.get(key).cloned())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.rows
            .read()
            .map(|rows| rows.current.len() + rows.history.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            terminates: self.counters.terminates.load(Ordering::Relaxed),
        }
    }

    fn describe(&self, key: &PrimaryKey) -> String {
        format!("{}[{}]", self.name, key)
    }

    fn window_start(&self, snapshot: &DataSnapshot) -> Result<BusinessDate> {
        snapshot.window().map(|w| w.from()).ok_or_else(|| {
            CacheError::InvariantViolation(format!(
                "dated store {} requires a validity window on {}",
                self.name,
                snapshot.key()
            ))
        })
    }

    fn check_injected_failure(&self) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            debug!("{}: failing write on request", self.name);
            return Err(CacheError::Persistence(format!(
                "injected write failure in {}",
                self.name
            )));
        }
        Ok(())
    }

    fn check_version(&self, key: &PrimaryKey, stored: u64, expected: u64) -> Result<()> {
        if stored != expected {
            return Err(CacheError::OptimisticLockFailure {
                key: self.describe(key),
                expected,
                actual: stored,
            });
        }
        Ok(())
    }
}

impl InMemoryStore {
    fn image_of(&self, rows: &Rows, key: &PrimaryKey) -> RowImage {
        if self.dated {
            RowImage {
                key: key.clone(),
                rows: rows
                    .history
                    .get(key)
                    .map(|h| h.values().map(|row| (**row).clone()).collect())
                    .unwrap_or_default(),
                retired: rows.retired.get(key).cloned().unwrap_or_default(),
            }
        } else {
            RowImage {
                key: key.clone(),
                rows: rows.current.get(key).cloned().into_iter().collect(),
                retired: Vec::new(),
            }
        }
    }

    fn put_back(&self, rows: &mut Rows, image: &RowImage) -> Result<()> {
        let key = &image.key;
        if self.dated {
            let mut history = History::new();
            for row in &image.rows {
                splice(&mut history, Arc::new(row.clone()))?;
            }
            if history.is_empty() {
                rows.history.remove(key);
            } else {
                rows.history.insert(key.clone(), history);
            }
            if image.retired.is_empty() {
                rows.retired.remove(key);
            } else {
                rows.retired.insert(key.clone(), image.retired.clone());
            }
        } else {
            match image.rows.last() {
                Some(row) => {
                    rows.current.insert(key.clone(), row.clone());
                }
                None => {
                    rows.current.remove(key);
                }
            }
        }
        Ok(())
    }

    fn apply_one(&self, rows: &mut Rows, write: &StoreWrite) -> Result<()> {
        self.check_injected_failure()?;
        match write {
            StoreWrite::Insert(row) => self.insert_row(rows, row),
            StoreWrite::Update { row, expected_version } => self.update_row(rows, row, *expected_version),
            StoreWrite::Delete(row) => self.delete_row(rows, row),
            StoreWrite::Terminate(row) => self.terminate_row(rows, row),
        }
    }

    fn insert_row(&self, rows: &mut Rows, snapshot: &DataSnapshot) -> Result<()> {
        let key = snapshot.key();
        if self.dated {
            let from = self.window_start(snapshot)?;
            let history = rows.history.entry(key.clone()).or_default();
            if history.contains_key(&from) {
                return Err(CacheError::DuplicateKey(self.describe(key)));
            }
            splice(history, Arc::new(snapshot.clone()))
        } else {
            if rows.current.contains_key(key) {
                return Err(CacheError::DuplicateKey(self.describe(key)));
            }
            rows.current.insert(key.clone(), snapshot.clone());
            Ok(())
        }
    }

    fn update_row(&self, rows: &mut Rows, snapshot: &DataSnapshot, expected_version: u64) -> Result<()> {
        let key = snapshot.key();
        if self.dated {
            let from = self.window_start(snapshot)?;
            let stored = rows
                .history
                .get(key)
                .and_then(|h| h.get(&from))
                .map(|row| row.version())
                .ok_or_else(|| CacheError::DeletedConcurrently(self.describe(key)))?;
            self.check_version(key, stored, expected_version)?;
            let history = rows.history.entry(key.clone()).or_default();
            splice(history, Arc::new(snapshot.clone()))
        } else {
            let row = rows
                .current
                .get_mut(key)
                .ok_or_else(|| CacheError::DeletedConcurrently(self.describe(key)))?;
            self.check_version(key, row.version(), expected_version)?;
            *row = snapshot.clone();
            Ok(())
        }
    }

    fn delete_row(&self, rows: &mut Rows, snapshot: &DataSnapshot) -> Result<()> {
        let key = snapshot.key();
        if self.dated {
            return Err(CacheError::InvariantViolation(format!(
                "rows of dated store {} are terminated, not deleted",
                self.name
            )));
        }

        let stored = rows
            .current
            .get(key)
            .map(|row| row.version())
            .ok_or_else(|| CacheError::DeletedConcurrently(self.describe(key)))?;
        self.check_version(key, stored, snapshot.version())?;
        rows.current.remove(key);
        Ok(())
    }

    /// Move the window `snapshot` carries from the live history to the
    /// retired rows of its key.
    fn terminate_row(&self, rows: &mut Rows, snapshot: &DataSnapshot) -> Result<()> {
        let key = snapshot.key();
        if !self.dated {
            return Err(CacheError::Persistence(format!(
                "terminate of {} is not supported by non-dated store {}",
                key, self.name
            )));
        }

        let from = self.window_start(snapshot)?;
        let stored = rows
            .history
            .get(key)
            .and_then(|h| h.get(&from))
            .map(|row| row.version())
            .ok_or_else(|| CacheError::DeletedConcurrently(self.describe(key)))?;
        self.check_version(key, stored, snapshot.version())?;

        let mut retired = None;
        if let Some(history) = rows.history.get_mut(key) {
            retired = history.remove(&from);
            if history.is_empty() {
                rows.history.remove(key);
            }
        }
        if let Some(row) = retired {
            rows.retired.entry(key.clone()).or_default().push((*row).clone());
        }
        Ok(())
    }

    fn count(&self, writes: &[StoreWrite]) {
        for write in writes {
            let counter = match write {
                StoreWrite::Insert(_) => &self.counters.inserts,
                StoreWrite::Update { .. } => &self.counters.updates,
                StoreWrite::Delete(_) => &self.counters.deletes,
                StoreWrite::Terminate(_) => &self.counters.terminates,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl PersistenceGateway for InMemoryStore {
    fn fetch(&self, key: &PrimaryKey) -> Result<Option<DataSnapshot>> {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.row(key))
    }

    fn fetch_as_of(&self, key: &PrimaryKey, date: BusinessDate) -> Result<Option<DataSnapshot>> {
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        let rows = self.rows.read()?;
        if !self.dated {
            return Ok(rows.current.get(key).cloned());
        }
        Ok(rows
            .history
            .get(key)
            .and_then(|h| h.range(..=date).next_back())
            .filter(|(_, row)| row.is_valid_at(date))
            .map(|(_, row)| (**row).clone()))
    }

    fn apply_batch(&self, writes: &[StoreWrite]) -> Result<Vec<RowImage>> {
        let mut rows = self.rows.write()?;

        let mut images: Vec<RowImage> = Vec::new();
        for write in writes {
            if !images.iter().any(|image| &image.key == write.key()) {
                images.push(self.image_of(&rows, write.key()));
            }
        }

        for write in writes {
            if let Err(err) = self.apply_one(&mut rows, write) {
                debug!(
                    "{}: batch of {} writes rejected at {}: {}",
                    self.name,
                    writes.len(),
                    write.key(),
                    err
                );
                for image in &images {
                    self.put_back(&mut rows, image)?;
                }
                return Err(err);
            }
        }

        self.count(writes);
        Ok(images)
    }

    fn restore(&self, images: &[RowImage]) -> Result<()> {
        let mut rows = self.rows.write()?;
        for image in images {
            self.put_back(&mut rows, image)?;
        }
        debug!("{}: restored {} keys", self.name, images.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{INFINITY, ValidityWindow};
    use chrono::{TimeZone, Utc};

    fn row(id: i64, qty: i64) -> DataSnapshot {
        DataSnapshot::new(PrimaryKey::from(id)).with_attribute("qty", qty)
    }

    fn day(d: u32) -> BusinessDate {
        Utc.with_ymd_and_hms(2024, 5, d, 0, 0, 0).unwrap()
    }

    fn qty(store: &InMemoryStore, id: i64) -> Option<i64> {
        store
            .row(&PrimaryKey::from(id))
            .and_then(|row| row.get("qty").and_then(|v| v.as_i64()))
    }

    #[test]
    fn test_insert_and_duplicate() {
        let store = InMemoryStore::new("order");
        store.apply_batch(&[StoreWrite::Insert(row(1, 5).with_version(1))]).unwrap();
        assert!(matches!(
            store.apply_batch(&[StoreWrite::Insert(row(1, 6).with_version(1))]),
            Err(CacheError::DuplicateKey(_))
        ));
        assert_eq!(store.stats().inserts, 1);
    }

    #[test]
    fn test_update_checks_version() {
        let store = InMemoryStore::new("order");
        store.put_external(row(1, 5)).unwrap();

        let stale = store.apply_batch(&[StoreWrite::Update {
            row: row(1, 7).with_version(3),
            expected_version: 2,
        }]);
        match stale {
            Err(CacheError::OptimisticLockFailure { expected, actual, .. }) => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        store
            .apply_batch(&[StoreWrite::Update {
                row: row(1, 7).with_version(2),
                expected_version: 1,
            }])
            .unwrap();
        assert_eq!(store.row(&PrimaryKey::from(1)).unwrap().version(), 2);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let store = InMemoryStore::new("order");
        store.put_external(row(1, 5)).unwrap();
        store.put_external(row(2, 5)).unwrap();
        // row 2 moved on behind the writer's back
        store.put_external(row(2, 6)).unwrap();

        let result = store.apply_batch(&[
            StoreWrite::Update {
                row: row(1, 99).with_version(2),
                expected_version: 1,
            },
            StoreWrite::Insert(row(3, 1).with_version(1)),
            StoreWrite::Update {
                row: row(2, 99).with_version(2),
                expected_version: 1,
            },
        ]);

        assert!(matches!(result, Err(CacheError::OptimisticLockFailure { .. })));
        assert_eq!(qty(&store, 1), Some(5));
        assert_eq!(qty(&store, 2), Some(6));
        assert!(store.row(&PrimaryKey::from(3)).is_none());
        assert_eq!(store.stats(), StoreStats::default());
    }

    #[test]
    fn test_restore_undoes_applied_batch() {
        let store = InMemoryStore::new("order");
        store.put_external(row(1, 5)).unwrap();

        let images = store
            .apply_batch(&[
                StoreWrite::Delete(row(1, 5).with_version(1)),
                StoreWrite::Insert(row(2, 8).with_version(1)),
            ])
            .unwrap();
        assert!(store.row(&PrimaryKey::from(1)).is_none());

        store.restore(&images).unwrap();
        assert_eq!(qty(&store, 1), Some(5));
        assert!(store.row(&PrimaryKey::from(2)).is_none());
    }

    #[test]
    fn test_external_writes_bump_version() {
        let store = InMemoryStore::new("order");
        assert_eq!(store.put_external(row(1, 5)).unwrap(), 1);
        assert_eq!(store.put_external(row(1, 6)).unwrap(), 2);
        assert!(store.remove_external(&PrimaryKey::from(1)).unwrap());
        assert!(store.fetch(&PrimaryKey::from(1)).unwrap().is_none());
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let store = InMemoryStore::new("order");
        store.fail_next_write();
        assert!(matches!(
            store.apply_batch(&[StoreWrite::Insert(row(1, 5))]),
            Err(CacheError::Persistence(_))
        ));
        assert!(store.apply_batch(&[StoreWrite::Insert(row(1, 5))]).is_ok());
    }

    #[test]
    fn test_dated_terminate_retires_window() {
        let store = InMemoryStore::dated("price");
        let open = row(1, 10).with_window(ValidityWindow::open_from(day(1)).unwrap());
        store.put_external(open.clone()).unwrap();

        let key = PrimaryKey::from(1);
        assert!(store.fetch_as_of(&key, day(3)).unwrap().is_some());
        assert!(store.fetch_as_of(&key, Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()).unwrap().is_none());

        let stored = store.row(&key).unwrap();
        let images = store.apply_batch(&[StoreWrite::Terminate(stored.clone())]).unwrap();
        assert!(store.fetch_as_of(&key, day(3)).unwrap().is_none());
        assert!(store.history(&key).is_empty());
        assert_eq!(store.retired(&key), vec![stored.clone()]);

        store.restore(&images).unwrap();
        assert_eq!(store.history(&key), vec![stored]);
        assert!(store.retired(&key).is_empty());
    }

    #[test]
    fn test_dated_store_rejects_delete() {
        let store = InMemoryStore::dated("price");
        let open = row(1, 10).with_window(ValidityWindow::new(day(1), *INFINITY).unwrap());
        store.put_external(open.clone()).unwrap();
        assert!(matches!(
            store.apply_batch(&[StoreWrite::Delete(open)]),
            Err(CacheError::InvariantViolation(_))
        ));
    }
}
