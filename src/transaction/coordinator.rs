// ============================================================================
// Coordinator
// ============================================================================
//
// Owns the objects enrolled by one logical transaction and drives their
// commit/rollback. Other transactions block on a coordinator through
// `wait_for_finish`, which refuses to wait when the wait chain already leads
// back to the waiter.
//
// ============================================================================

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, warn};
use tracing::{Level, event, info_span};

use super::enlistment::{EnrollMode, Enlistment, TransactionalObject};
use super::flush::FlushBatch;
use super::state::{CoordinatorId, CoordinatorStatus, ParticipationMode};
use crate::config::CacheConfig;
use crate::core::{CacheError, Result};

/// Longest wait chain inspected for cycles
const MAX_WAIT_CHAIN: usize = 64;

lazy_static! {
    /// Serializes wait-chain inspection against wait-chain updates
    static ref COORDINATION_LOCK: Mutex<()> = Mutex::new(());
}

pub struct Coordinator {
    id: CoordinatorId,
    name: String,
    started: Instant,
    timeout: Duration,
    participation: ParticipationMode,
    detect_deadlocks: bool,
    status: Mutex<CoordinatorStatus>,
    finished: Condvar,
    enlisted: Mutex<Vec<Enlistment>>,
    waiting_for: Mutex<Option<Arc<Coordinator>>>,
}

impl Coordinator {
    pub fn new(name: impl Into<String>, config: &CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            id: CoordinatorId::new(),
            name: name.into(),
            started: Instant::now(),
            timeout: config.transaction_timeout,
            participation: config.participation,
            detect_deadlocks: config.detect_deadlocks,
            status: Mutex::new(CoordinatorStatus::Active),
            finished: Condvar::new(),
            enlisted: Mutex::new(Vec::new()),
            waiting_for: Mutex::new(None),
        })
    }

    pub fn id(&self) -> CoordinatorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn participation(&self) -> ParticipationMode {
        self.participation
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Instant after which waits on behalf of this coordinator give up
    pub fn deadline(&self) -> Instant {
        self.started + self.timeout
    }

    pub fn status(&self) -> CoordinatorStatus {
        *self.lock_status()
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn enlisted_count(&self) -> usize {
        self.lock_enlisted().len()
    }

    /// Fails unless the coordinator still accepts work.
    pub fn ensure_active(&self) -> Result<()> {
        let status = self.status();
        if !status.is_active() {
            return Err(CacheError::InvalidTransactionState(format!(
                "{} is {}",
                self.id, status
            )));
        }
        Ok(())
    }

    /// Record that `object` takes part in this transaction. A repeated
    /// write enrollment upgrades an existing read enlistment in place.
    pub fn enroll_object(&self, object: Arc<dyn TransactionalObject>, mode: EnrollMode) {
        let mut enlisted = self.lock_enlisted();
        match enlisted.iter_mut().find(|e| e.refers_to(&object)) {
            Some(existing) => {
                if mode == EnrollMode::Write {
                    existing.mode = EnrollMode::Write;
                }
            }
            None => enlisted.push(Enlistment::new(object, mode)),
        }
    }

    /// Undo a write enrollment of `object` that was given up before use:
    /// back to a read enlistment, or gone when it was not one before.
    pub fn withdraw_write(&self, object: &Arc<dyn TransactionalObject>, keep_read: bool) {
        let mut enlisted = self.lock_enlisted();
        if keep_read {
            if let Some(existing) = enlisted.iter_mut().find(|e| e.refers_to(object)) {
                existing.mode = EnrollMode::Read;
            }
        } else {
            enlisted.retain(|e| !e.refers_to(object));
        }
    }

    /// Flush every write enlistment, then reconcile every enlistment.
    ///
    /// Flushed writes reach the stores as one unit per commit. A flush
    /// failure leaves every store as it was, rolls the whole transaction
    /// back and is returned.
    pub fn commit(&self) -> Result<()> {
        self.transition(CoordinatorStatus::Committing)?;

        let enlisted = std::mem::take(&mut *self.lock_enlisted());
        let span = info_span!("coordinator.commit", id = %self.id, objects = enlisted.len());
        let _guard = span.enter();

        let mut batch = FlushBatch::new();
        let queued = enlisted
            .iter()
            .filter(|e| e.is_write())
            .try_for_each(|e| e.object.flush(self, &mut batch));
        let flushed = queued.and_then(|()| {
            event!(Level::DEBUG, id = %self.id, writes = batch.len(), "flushing");
            batch.apply()
        });

        if let Err(err) = flushed {
            warn!("{}: flush failed, rolling back: {}", self.id, err);
            self.set_status(CoordinatorStatus::RollingBack);
            for e in &enlisted {
                e.object.rollback(self);
            }
            self.finish(CoordinatorStatus::RolledBack);
            return Err(err);
        }

        for enlistment in &enlisted {
            enlistment.object.commit(self);
        }

        event!(Level::DEBUG, id = %self.id, "committed");
        self.finish(CoordinatorStatus::Committed);
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.transition(CoordinatorStatus::RollingBack)?;

        let enlisted = std::mem::take(&mut *self.lock_enlisted());
        let span = info_span!("coordinator.rollback", id = %self.id, objects = enlisted.len());
        let _guard = span.enter();

        for enlistment in &enlisted {
            enlistment.object.rollback(self);
        }

        event!(Level::DEBUG, id = %self.id, "rolled back");
        self.finish(CoordinatorStatus::RolledBack);
        Ok(())
    }

    /// Block `waiter` until this coordinator committed or rolled back.
    ///
    /// Bounded by the waiter's deadline. Returns `Deadlock` without
    /// blocking when this coordinator already waits, directly or through
    /// others, on `waiter`.
    pub fn wait_for_finish(self: &Arc<Self>, waiter: &Arc<Coordinator>) -> Result<()> {
        if self.id == waiter.id {
            return Ok(());
        }

        if waiter.detect_deadlocks {
            let _coordination = COORDINATION_LOCK.lock()?;
            if self.waits_on(waiter.id) {
                warn!("{} would wait on {}, which waits on it", waiter.id, self.id);
                return Err(CacheError::Deadlock {
                    waiting: waiter.id,
                    blocker: self.id,
                });
            }
            *waiter.waiting_for.lock()? = Some(Arc::clone(self));
        }

        let result = self.block_until_finished(waiter);

        if waiter.detect_deadlocks {
            let _coordination = COORDINATION_LOCK.lock()?;
            *waiter.waiting_for.lock()? = None;
        }
        result
    }

    fn block_until_finished(&self, waiter: &Coordinator) -> Result<()> {
        let deadline = waiter.deadline();
        let waited = Instant::now();
        let mut status = self.status.lock()?;

        while !status.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} gave up waiting for {} ({}) after {}ms",
                    waiter.id,
                    self.id,
                    self.name,
                    waited.elapsed().as_millis()
                );
                return Err(CacheError::TransactionBusyTimeout {
                    waiting: waiter.id,
                    blocker: self.id,
                    waited_ms: waited.elapsed().as_millis(),
                });
            }
            let (next, _) = self.finished.wait_timeout(status, deadline - now)?;
            status = next;
        }

        debug!(
            "{} resumed after {} finished as {}",
            waiter.id, self.id, *status
        );
        Ok(())
    }

    /// Walk the wait chain starting at `self` looking for `target`.
    fn waits_on(&self, target: CoordinatorId) -> bool {
        let mut next = self
            .waiting_for
            .lock()
            .ok()
            .and_then(|w| w.as_ref().map(Arc::clone));

        for _ in 0..MAX_WAIT_CHAIN {
            let Some(current) = next else {
                return false;
            };
            if current.id == target {
                return true;
            }
            next = current
                .waiting_for
                .lock()
                .ok()
                .and_then(|w| w.as_ref().map(Arc::clone));
        }
        false
    }

    fn transition(&self, next: CoordinatorStatus) -> Result<()> {
        let mut status = self.status.lock()?;
        if !status.is_active() {
            return Err(CacheError::InvalidTransactionState(format!(
                "cannot move {} from {} to {}",
                self.id, *status, next
            )));
        }
        *status = next;
        Ok(())
    }

    fn set_status(&self, next: CoordinatorStatus) {
        *self.lock_status() = next;
    }

    fn finish(&self, terminal: CoordinatorStatus) {
        self.set_status(terminal);
        self.finished.notify_all();
    }

    // Poisoning only means another thread panicked mid-update; the status
    // value itself is always a complete write.
    fn lock_status(&self) -> MutexGuard<'_, CoordinatorStatus> {
        self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_enlisted(&self) -> MutexGuard<'_, Vec<Enlistment>> {
        self.enlisted.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl std::fmt::Display for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} ({})", self.id, self.name)
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("participation", &self.participation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        flushes: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        fail_flush: bool,
    }

    impl TransactionalObject for Recorder {
        fn describe(&self) -> String {
            "recorder[1]".to_string()
        }

        fn flush(&self, _coordinator: &Coordinator, _batch: &mut FlushBatch) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            if self.fail_flush {
                return Err(CacheError::Persistence("disk full".into()));
            }
            Ok(())
        }

        fn commit(&self, _coordinator: &Coordinator) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn rollback(&self, _coordinator: &Coordinator) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> CacheConfig {
        CacheConfig::new().transaction_timeout(Duration::from_millis(200))
    }

    #[test]
    fn test_enroll_upgrades_in_place() {
        let coordinator = Coordinator::new("upgrade", &config());
        let recorder: Arc<dyn TransactionalObject> = Arc::new(Recorder::default());

        coordinator.enroll_object(Arc::clone(&recorder), EnrollMode::Read);
        coordinator.enroll_object(Arc::clone(&recorder), EnrollMode::Write);
        coordinator.enroll_object(Arc::clone(&recorder), EnrollMode::Read);

        assert_eq!(coordinator.enlisted_count(), 1);
        let enlisted = coordinator.lock_enlisted();
        assert_eq!(enlisted[0].mode, EnrollMode::Write);
    }

    #[test]
    fn test_withdraw_write() {
        let coordinator = Coordinator::new("withdraw", &config());
        let upgraded: Arc<dyn TransactionalObject> = Arc::new(Recorder::default());
        let fresh: Arc<dyn TransactionalObject> = Arc::new(Recorder::default());

        coordinator.enroll_object(Arc::clone(&upgraded), EnrollMode::Read);
        coordinator.enroll_object(Arc::clone(&upgraded), EnrollMode::Write);
        coordinator.enroll_object(Arc::clone(&fresh), EnrollMode::Write);

        coordinator.withdraw_write(&upgraded, true);
        coordinator.withdraw_write(&fresh, false);

        let enlisted = coordinator.lock_enlisted();
        assert_eq!(enlisted.len(), 1);
        assert!(enlisted[0].refers_to(&upgraded));
        assert_eq!(enlisted[0].mode, EnrollMode::Read);
    }

    #[test]
    fn test_commit_flushes_writes_only() {
        let coordinator = Coordinator::new("commit", &config());
        let writer = Arc::new(Recorder::default());
        let reader = Arc::new(Recorder::default());

        coordinator.enroll_object(writer.clone(), EnrollMode::Write);
        coordinator.enroll_object(reader.clone(), EnrollMode::Read);
        coordinator.commit().unwrap();

        assert_eq!(writer.flushes.load(Ordering::SeqCst), 1);
        assert_eq!(reader.flushes.load(Ordering::SeqCst), 0);
        assert_eq!(writer.commits.load(Ordering::SeqCst), 1);
        assert_eq!(reader.commits.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.status(), CoordinatorStatus::Committed);
    }

    #[test]
    fn test_failed_flush_rolls_everything_back() {
        let coordinator = Coordinator::new("flush failure", &config());
        let failing = Arc::new(Recorder {
            fail_flush: true,
            ..Recorder::default()
        });
        let other = Arc::new(Recorder::default());

        coordinator.enroll_object(other.clone(), EnrollMode::Write);
        coordinator.enroll_object(failing.clone(), EnrollMode::Write);

        assert!(matches!(coordinator.commit(), Err(CacheError::Persistence(_))));
        assert_eq!(other.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(failing.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(other.commits.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.status(), CoordinatorStatus::RolledBack);
    }

    #[test]
    fn test_double_commit_is_rejected() {
        let coordinator = Coordinator::new("twice", &config());
        coordinator.commit().unwrap();
        assert!(matches!(
            coordinator.commit(),
            Err(CacheError::InvalidTransactionState(_))
        ));
        assert!(coordinator.rollback().is_err());
    }

    #[test]
    fn test_wait_for_finish_wakes_on_commit() {
        let blocker = Coordinator::new("blocker", &config());
        let waiter = Coordinator::new("waiter", &config());

        let committer = {
            let blocker = Arc::clone(&blocker);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                blocker.commit().unwrap();
            })
        };

        blocker.wait_for_finish(&waiter).unwrap();
        assert_eq!(blocker.status(), CoordinatorStatus::Committed);
        committer.join().unwrap();
    }

    #[test]
    fn test_wait_for_finish_times_out() {
        let blocker = Coordinator::new("blocker", &config());
        let waiter = Coordinator::new(
            "waiter",
            &config().transaction_timeout(Duration::from_millis(30)),
        );

        let err = blocker.wait_for_finish(&waiter).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_retriable());
    }

    #[test]
    fn test_wait_chain_cycle_is_a_deadlock() {
        let a = Coordinator::new("a", &config());
        let b = Coordinator::new("b", &config());

        // a is already waiting on b
        *a.waiting_for.lock().unwrap() = Some(Arc::clone(&b));

        let err = a.wait_for_finish(&b).unwrap_err();
        assert!(matches!(err, CacheError::Deadlock { .. }));
        assert!(err.is_retriable());
    }
}
