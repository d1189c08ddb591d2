// ============================================================================
// Persistent Handle
// ============================================================================
//
// Long-lived identity of one cached business object.
//
//   committed: last published snapshot, swapped atomically at commit
//   overlay:   transactional claims, replaced by compare-and-set only
//
// Readers outside a transaction never lock: they load `committed`, compare
// its staleness token with the type's update counter and re-fetch when it
// is behind. Transactions enroll first and resolve conflicts there, so
// commit and rollback only reconcile.
//
// ============================================================================

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, warn};

use super::behavior::{Attempt, Behavior};
use super::detached::DetachedObject;
use super::overlay::TransactionOverlay;
use super::slot::AtomicSlot;
use super::temporal::{TemporalPolicy, WindowEdit};
use crate::cache::{ObjectIndex, PerClassUpdateCountHolder, TemporalWindowTracker};
use crate::core::{
    BusinessDate, CacheError, DataSnapshot, INFINITY, PersistenceState, PrimaryKey, Result, Value,
};
use crate::storage::{PersistenceGateway, StoreWrite};
use crate::transaction::{Coordinator, CoordinatorId, EnrollMode, FlushBatch, TransactionalObject};

/// Collaborators shared by every handle of one business type
pub struct TypeContext<P: TemporalPolicy> {
    name: String,
    gateway: Arc<dyn PersistenceGateway>,
    update_count: Arc<PerClassUpdateCountHolder>,
    tracker: Arc<TemporalWindowTracker>,
    index: Weak<dyn ObjectIndex<P>>,
    cas_attempts: usize,
}

impl<P: TemporalPolicy> TypeContext<P> {
    pub fn new(
        name: &str,
        gateway: Arc<dyn PersistenceGateway>,
        update_count: Arc<PerClassUpdateCountHolder>,
        tracker: Arc<TemporalWindowTracker>,
        index: &Arc<dyn ObjectIndex<P>>,
        cas_attempts: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            gateway,
            update_count,
            tracker,
            index: Arc::downgrade(index),
            cas_attempts: cas_attempts.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    pub fn update_count(&self) -> &Arc<PerClassUpdateCountHolder> {
        &self.update_count
    }

    pub fn tracker(&self) -> &Arc<TemporalWindowTracker> {
        &self.tracker
    }

    fn index(&self) -> Option<Arc<dyn ObjectIndex<P>>> {
        self.index.upgrade()
    }
}

pub struct PersistentHandle<P: TemporalPolicy> {
    this: Weak<Self>,
    key: PrimaryKey,
    context: Arc<TypeContext<P>>,
    committed: AtomicSlot<DataSnapshot>,
    state: AtomicU8,
    overlay: AtomicSlot<TransactionOverlay>,
    /// Business date of the last as-of read; dated objects only
    as_of: AtomicSlot<BusinessDate>,
}

impl<P: TemporalPolicy> PersistentHandle<P> {
    /// Handle for a row read from the store
    pub(crate) fn materialize(context: Arc<TypeContext<P>>, snapshot: DataSnapshot) -> Arc<Self> {
        Self::build(context, snapshot, PersistenceState::Persisted)
    }

    /// Handle for an object that exists only in memory until inserted
    pub(crate) fn in_memory(context: Arc<TypeContext<P>>, snapshot: DataSnapshot) -> Arc<Self> {
        Self::build(context, snapshot, PersistenceState::InMemory)
    }

    fn build(context: Arc<TypeContext<P>>, snapshot: DataSnapshot, state: PersistenceState) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            key: snapshot.key().clone(),
            context,
            committed: AtomicSlot::new(Some(Arc::new(snapshot))),
            state: AtomicU8::new(state as u8),
            overlay: AtomicSlot::empty(),
            as_of: AtomicSlot::empty(),
        })
    }

    // ========================================
    // Identity and diagnostics
    // ========================================

    pub fn key(&self) -> &PrimaryKey {
        &self.key
    }

    pub fn type_name(&self) -> &str {
        &self.context.name
    }

    /// `type[key]`
    pub fn describe(&self) -> String {
        format!("{}[{}]", self.context.name, self.key)
    }

    pub fn persistence_state(&self) -> PersistenceState {
        PersistenceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Committed snapshot as is, without a staleness check
    pub fn committed(&self) -> Option<Arc<DataSnapshot>> {
        self.committed.load()
    }

    pub fn overlay(&self) -> Option<Arc<TransactionOverlay>> {
        self.overlay.load()
    }

    pub fn is_enrolled(&self) -> bool {
        !self.overlay.is_empty()
    }

    pub fn writer(&self) -> Option<CoordinatorId> {
        self.overlay.load().and_then(|o| o.writer().map(|w| w.id()))
    }

    pub fn readers(&self) -> Vec<CoordinatorId> {
        self.overlay
            .load()
            .map(|o| o.readers().iter().map(|r| r.id()).collect())
            .unwrap_or_default()
    }

    /// Business date this object was last read for, `now` when it never was
    pub fn business_date(&self) -> BusinessDate {
        self.as_of.load().map(|date| *date).unwrap_or_else(Utc::now)
    }

    pub fn behavior_for(&self, caller: Option<&Coordinator>) -> Behavior {
        Behavior::resolve(
            self.persistence_state(),
            self.overlay.load(),
            caller.map(|c| c.id()),
        )
    }

    // ========================================
    // Enrollment
    // ========================================

    /// Take a shared claim for `tx`.
    ///
    /// Returns `true` when a claim was installed and `false` when `tx`
    /// already took part. Fails with `WouldBlock` while another coordinator
    /// holds the exclusive claim.
    pub fn enroll_for_read(&self, tx: &Arc<Coordinator>) -> Result<bool> {
        tx.ensure_active()?;
        self.ensure_not_deleted()?;
        let object = self.as_object()?;

        for _ in 0..self.context.cas_attempts {
            match self.try_enroll_read(tx) {
                Attempt::Installed => {
                    tx.enroll_object(object, EnrollMode::Read);
                    return Ok(true);
                }
                Attempt::AlreadyEnrolled => return Ok(false),
                Attempt::Blocked(blocker) => return Err(self.would_block(blocker)),
                Attempt::ReadersActive(_) | Attempt::Lost => std::hint::spin_loop(),
            }
        }
        Err(CacheError::Contended(self.describe()))
    }

    fn try_enroll_read(&self, tx: &Arc<Coordinator>) -> Attempt {
        let current = self.overlay.load();
        let next = match current.as_deref() {
            None => TransactionOverlay::shared(Arc::clone(tx), self.persistence_state()),
            Some(overlay) if overlay.is_participant(tx.id()) => return Attempt::AlreadyEnrolled,
            Some(overlay) => match overlay.writer() {
                Some(writer) => return Attempt::Blocked(Arc::clone(writer)),
                None => match overlay.with_reader(Arc::clone(tx)) {
                    Some(next) => next,
                    None => return Attempt::Lost,
                },
            },
        };

        if self.overlay.compare_and_set(current.as_ref(), Some(Arc::new(next))) {
            Attempt::Installed
        } else {
            Attempt::Lost
        }
    }

    /// Take the exclusive claim for `tx` with a private copy of the
    /// committed snapshot.
    ///
    /// A sole reader is upgraded in place. Foreign readers make this fail
    /// with `ReadersActive`; see [`Self::lock_for_write`] for the waiting
    /// variant.
    pub fn enroll_for_write(&self, tx: &Arc<Coordinator>) -> Result<bool> {
        tx.ensure_active()?;
        self.ensure_not_deleted()?;
        let object = self.as_object()?;

        for _ in 0..self.context.cas_attempts {
            match self.try_enroll_write(tx)? {
                Attempt::Installed => {
                    tx.enroll_object(object, EnrollMode::Write);
                    debug!("{} write-enrolled {}", tx.id(), self.describe());
                    return Ok(true);
                }
                Attempt::AlreadyEnrolled => return Ok(false),
                Attempt::Blocked(blocker) => return Err(self.would_block(blocker)),
                Attempt::ReadersActive(readers) => {
                    return Err(CacheError::ReadersActive {
                        key: self.describe(),
                        readers,
                    });
                }
                Attempt::Lost => std::hint::spin_loop(),
            }
        }
        Err(CacheError::Contended(self.describe()))
    }

    fn try_enroll_write(&self, tx: &Arc<Coordinator>) -> Result<Attempt> {
        let current = self.overlay.load();

        match Behavior::resolve(self.persistence_state(), current.clone(), Some(tx.id())) {
            Behavior::Deleted => return Err(CacheError::ObjectDeleted(self.describe())),
            Behavior::Writer { .. } => return Ok(Attempt::AlreadyEnrolled),
            Behavior::ForeignWriter { blocker } => return Ok(Attempt::Blocked(blocker)),
            Behavior::Reader { sole: false } => {
                let readers: Vec<CoordinatorId> = current
                    .as_deref()
                    .map(|o| o.foreign_participants(tx.id()).iter().map(|r| r.id()).collect())
                    .unwrap_or_default();
                return Ok(Attempt::ReadersActive(readers));
            }
            Behavior::Unenrolled { readers } if !readers.is_empty() => {
                return Ok(Attempt::ReadersActive(readers));
            }
            _ => {}
        }

        // The CAS below only succeeds against the exact overlay inspected
        // above, so a reader joining mid-upgrade turns it into `Lost`.
        let base = self
            .committed
            .load()
            .ok_or_else(|| CacheError::ObjectDeleted(self.describe()))?;
        let next = TransactionOverlay::exclusive(
            Arc::clone(tx),
            (*base).clone(),
            self.persistence_state(),
        );

        if self.overlay.compare_and_set(current.as_ref(), Some(Arc::new(next))) {
            Ok(Attempt::Installed)
        } else {
            Ok(Attempt::Lost)
        }
    }

    /// Block until no coordinator but `tx` takes part in this object, or
    /// until the deadline of `tx` passes.
    pub fn wait_for_transactions(&self, tx: &Arc<Coordinator>) -> Result<()> {
        loop {
            let foreign = self
                .overlay
                .load()
                .map(|o| o.foreign_participants(tx.id()))
                .unwrap_or_default();
            let Some(blocker) = foreign.first() else {
                return Ok(());
            };

            if blocker.status().is_terminal() {
                // finished, its claim is about to be released
                if Instant::now() >= tx.deadline() {
                    return Err(CacheError::TransactionBusyTimeout {
                        waiting: tx.id(),
                        blocker: blocker.id(),
                        waited_ms: tx.elapsed().as_millis(),
                    });
                }
                thread::yield_now();
                continue;
            }
            blocker.wait_for_finish(tx)?;
        }
    }

    /// Write-enroll, waiting out foreign readers.
    pub fn lock_for_write(&self, tx: &Arc<Coordinator>) -> Result<()> {
        tx.ensure_active()?;
        self.refresh_before_write(tx)?;

        loop {
            match self.enroll_for_write(tx) {
                Err(CacheError::ReadersActive { .. }) => self.wait_for_transactions(tx)?,
                other => return other.map(|_| ()),
            }
        }
    }

    /// Take a shared claim without reading.
    pub fn lock_for_transaction(&self, tx: &Arc<Coordinator>) -> Result<()> {
        self.enroll_for_read(tx).map(|_| ())
    }

    // ========================================
    // Reads
    // ========================================

    /// Committed data, re-fetched first when the staleness token is behind.
    pub fn read(&self) -> Result<Arc<DataSnapshot>> {
        let snapshot = self.committed_or_deleted()?;
        match self.persistence_state() {
            PersistenceState::Deleted => Err(CacheError::ObjectDeleted(self.describe())),
            PersistenceState::InMemory => Ok(snapshot),
            PersistenceState::Persisted => {
                if self.context.update_count.is_current(snapshot.data_version()) {
                    Ok(snapshot)
                } else {
                    self.refresh(&snapshot, None)
                }
            }
        }
    }

    /// Committed data authoritative at `date`.
    ///
    /// Refreshes when the cached window does not contain `date`, even if the
    /// staleness token is current. A dated object remembers `date` as its
    /// business date.
    pub fn read_as_of(&self, date: BusinessDate) -> Result<Arc<DataSnapshot>> {
        let snapshot = self.committed_or_deleted()?;
        let found = match self.persistence_state() {
            PersistenceState::Deleted => Err(CacheError::ObjectDeleted(self.describe())),
            PersistenceState::InMemory => {
                if snapshot.is_valid_at(date) {
                    Ok(snapshot)
                } else {
                    Err(self.not_found_at(date))
                }
            }
            PersistenceState::Persisted => {
                if snapshot.is_valid_at(date)
                    && self.context.update_count.is_current(snapshot.data_version())
                {
                    Ok(snapshot)
                } else {
                    self.refresh(&snapshot, Some(date))
                }
            }
        }?;
        if P::DATED {
            self.as_of.store(Some(Arc::new(date)));
        }
        Ok(found)
    }

    /// Data as seen by `tx`: its working copy when it writes the object,
    /// otherwise the committed data. Read-locked transactions enroll first.
    pub fn read_in(&self, tx: &Arc<Coordinator>) -> Result<Arc<DataSnapshot>> {
        self.read_transactional(tx, None)
    }

    pub fn read_as_of_in(&self, tx: &Arc<Coordinator>, date: BusinessDate) -> Result<Arc<DataSnapshot>> {
        self.read_transactional(tx, Some(date))
    }

    fn read_transactional(&self, tx: &Arc<Coordinator>, as_of: Option<BusinessDate>) -> Result<Arc<DataSnapshot>> {
        tx.ensure_active()?;
        let locks_reads = tx.participation().locks_reads();

        match self.behavior_for(Some(tx.as_ref())) {
            Behavior::Deleted => Err(CacheError::ObjectDeleted(self.describe())),
            Behavior::Writer { overlay } => {
                if overlay.target_state().is_deleted() {
                    return Err(CacheError::ObjectDeleted(self.describe()));
                }
                let working = self.working_of(&overlay)?;
                match as_of {
                    Some(date) if !working.is_valid_at(date) => Err(self.not_found_at(date)),
                    Some(date) => {
                        self.as_of.store(Some(Arc::new(date)));
                        Ok(working)
                    }
                    None => Ok(working),
                }
            }
            Behavior::ForeignWriter { blocker } if locks_reads => Err(self.would_block(blocker)),
            Behavior::Unenrolled { .. } if locks_reads => {
                self.enroll_for_read(tx)?;
                self.read_committed(as_of)
            }
            _ => self.read_committed(as_of),
        }
    }

    fn read_committed(&self, as_of: Option<BusinessDate>) -> Result<Arc<DataSnapshot>> {
        match as_of {
            Some(date) => self.read_as_of(date),
            None => self.read(),
        }
    }

    pub fn get(&self, attribute: &str) -> Result<Option<Value>> {
        Ok(self.read()?.get(attribute).cloned())
    }

    /// Owned copy of the committed data for offline edits
    pub fn detached_copy(&self) -> Result<DetachedObject> {
        let snapshot = self.read()?;
        Ok(DetachedObject::new(self.describe(), (*snapshot).clone()))
    }

    // ========================================
    // Writes
    // ========================================

    pub fn set_attribute(&self, tx: &Arc<Coordinator>, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.lock_for_write(tx)?;
        self.edit_working(tx, |working| {
            working.set(name, value);
            Ok(())
        })
    }

    /// Overwrite every attribute with those of `source`.
    ///
    /// Under optimistic locking the version of `source` must match the
    /// version this object is based on. The check runs before anything is
    /// mutated; a claim taken by this call is given up again when it fails.
    pub fn copy_attributes_from(&self, tx: &Arc<Coordinator>, source: &DataSnapshot) -> Result<()> {
        tx.ensure_active()?;
        if source.key() != &self.key {
            return Err(CacheError::InvariantViolation(format!(
                "cannot copy {} into {}",
                source.key(),
                self.describe()
            )));
        }

        let optimistic = !tx.participation().locks_reads();
        if optimistic {
            self.check_version(tx, source)?;
        }
        let prior = self.behavior_for(Some(tx.as_ref()));
        self.lock_for_write(tx)?;
        if optimistic {
            // a commit may have slipped in between the check and the lock
            if let Err(err) = self.check_version(tx, source) {
                match prior {
                    Behavior::Writer { .. } => {}
                    Behavior::Reader { .. } => self.abandon_write(tx, true),
                    _ => self.abandon_write(tx, false),
                }
                return Err(err);
            }
        }

        self.edit_working(tx, |working| {
            working.copy_attributes(source);
            Ok(())
        })
    }

    /// Persist an in-memory object at commit of `tx`.
    pub fn insert(&self, tx: &Arc<Coordinator>) -> Result<()> {
        self.ensure_in_memory()?;
        self.lock_for_write(tx)?;
        self.edit_own_overlay(tx, |overlay| {
            Ok(overlay.with_target_state(PersistenceState::Persisted))
        })
    }

    /// Insert a dated object valid from its creation date until `until`.
    pub fn insert_until(&self, tx: &Arc<Coordinator>, until: BusinessDate) -> Result<()> {
        self.ensure_in_memory()?;
        let described = self.describe();
        P::open_window(&*self.committed_or_deleted()?, until, &described)?;

        self.lock_for_write(tx)?;
        self.edit_own_overlay(tx, |overlay| {
            let working = self.working_of(overlay)?;
            let edited = P::open_window(&working, until, &described)?;
            overlay
                .with_working(edited)
                .map(|o| o.with_target_state(PersistenceState::Persisted))
                .ok_or_else(|| self.not_write_enrolled(tx))
        })
    }

    /// Remove the object at commit of `tx`. Refused for dated objects.
    pub fn delete(&self, tx: &Arc<Coordinator>) -> Result<()> {
        P::check_delete(&self.describe())?;
        self.ensure_persisted()?;
        self.lock_for_write(tx)?;
        self.edit_own_overlay(tx, |overlay| {
            Ok(overlay.with_target_state(PersistenceState::Deleted))
        })
    }

    /// End validity of a dated object at its business date.
    ///
    /// The window is cut to `[from, business_date)`; a window starting at
    /// that date is retired as a whole. Earlier history is kept.
    pub fn terminate(&self, tx: &Arc<Coordinator>) -> Result<()> {
        self.ensure_persisted()?;
        let described = self.describe();
        let as_of = self.business_date();
        P::terminate_at(&*self.committed_or_deleted()?, as_of, &described)?;

        self.lock_for_write(tx)?;
        self.edit_own_overlay(tx, |overlay| {
            let working = self.working_of(overlay)?;
            match P::terminate_at(&working, as_of, &described)? {
                WindowEdit::Closed(edited) => overlay
                    .with_working(edited)
                    .ok_or_else(|| self.not_write_enrolled(tx)),
                WindowEdit::Retired => Ok(overlay.with_target_state(PersistenceState::Deleted)),
            }
        })
    }

    /// Close the validity window of a dated object at `until`
    /// (exclusive). `INFINITY` is a full [`Self::terminate`].
    pub fn terminate_until(&self, tx: &Arc<Coordinator>, until: BusinessDate) -> Result<()> {
        if until == *INFINITY {
            return self.terminate(tx);
        }
        self.ensure_persisted()?;
        let described = self.describe();
        P::close_window(&*self.committed_or_deleted()?, until, &described)?;

        self.lock_for_write(tx)?;
        self.edit_own_overlay(tx, |overlay| {
            let working = self.working_of(overlay)?;
            let edited = P::close_window(&working, until, &described)?;
            overlay
                .with_working(edited)
                .ok_or_else(|| self.not_write_enrolled(tx))
        })
    }

    fn edit_working<F>(&self, tx: &Arc<Coordinator>, edit: F) -> Result<()>
    where
        F: FnOnce(&mut DataSnapshot) -> Result<()>,
    {
        self.edit_own_overlay(tx, |overlay| {
            let mut working = (*self.working_of(overlay)?).clone();
            edit(&mut working)?;
            overlay
                .with_working(working)
                .ok_or_else(|| self.not_write_enrolled(tx))
        })
    }

    /// Replace the overlay `tx` holds exclusively.
    ///
    /// Only the writer replaces an exclusive overlay, so a failed CAS means
    /// the claim was lost underneath the caller.
    fn edit_own_overlay<F>(&self, tx: &Arc<Coordinator>, edit: F) -> Result<()>
    where
        F: FnOnce(&TransactionOverlay) -> Result<TransactionOverlay>,
    {
        let current = self
            .overlay
            .load()
            .filter(|o| o.is_writer(tx.id()))
            .ok_or_else(|| self.not_write_enrolled(tx))?;
        if current.target_state().is_deleted() {
            return Err(CacheError::ObjectDeleted(self.describe()));
        }

        let next = edit(&current)?;
        if self.overlay.compare_and_set(Some(&current), Some(Arc::new(next))) {
            Ok(())
        } else {
            Err(CacheError::Contended(self.describe()))
        }
    }

    fn check_version(&self, tx: &Arc<Coordinator>, source: &DataSnapshot) -> Result<()> {
        let actual = match self.behavior_for(Some(tx.as_ref())) {
            Behavior::Writer { overlay } => self.working_of(&overlay)?.version(),
            _ => self.committed_or_deleted()?.version(),
        };
        if source.version() != actual {
            return Err(CacheError::OptimisticLockFailure {
                key: self.describe(),
                expected: source.version(),
                actual,
            });
        }
        Ok(())
    }

    // ========================================
    // Refresh
    // ========================================

    fn refresh_before_write(&self, tx: &Arc<Coordinator>) -> Result<()> {
        if self.persistence_state() != PersistenceState::Persisted {
            return Ok(());
        }
        if self.overlay.load().is_some_and(|o| o.is_writer(tx.id())) {
            return Ok(());
        }
        let snapshot = self.committed_or_deleted()?;
        if !self.context.update_count.is_current(snapshot.data_version()) {
            self.refresh(&snapshot, None)?;
        }
        Ok(())
    }

    fn refresh(&self, stale: &Arc<DataSnapshot>, as_of: Option<BusinessDate>) -> Result<Arc<DataSnapshot>> {
        let token = self.context.update_count.current_count();
        let date = as_of.or_else(|| stale.window().map(|w| w.from()));

        if P::DATED {
            if let Some(date) = date {
                if let Some(known) = self.context.tracker.active_for(&self.key, date)? {
                    if self.context.update_count.is_current(known.data_version()) {
                        self.committed.compare_and_set(Some(stale), Some(Arc::clone(&known)));
                        return Ok(known);
                    }
                }
            }
        }

        match P::fetch(self.context.gateway.as_ref(), &self.key, date)? {
            Some(row) => {
                let fresh = Arc::new(row.with_data_version(token));
                if P::DATED {
                    self.context.tracker.reconcile(&self.key, Arc::clone(&fresh))?;
                }
                // a concurrent publish wins over this refresh
                self.committed.compare_and_set(Some(stale), Some(Arc::clone(&fresh)));
                debug!("refreshed {} at version {}", self.describe(), fresh.version());
                Ok(fresh)
            }
            None => match date {
                // dated rows are never deleted, only this date is uncovered
                Some(date) if P::DATED => Err(self.not_found_at(date)),
                _ => {
                    self.mark_deleted_concurrently();
                    Err(CacheError::DeletedConcurrently(self.describe()))
                }
            },
        }
    }

    fn mark_deleted_concurrently(&self) {
        let transitioned = self
            .state
            .compare_exchange(
                PersistenceState::Persisted as u8,
                PersistenceState::Deleted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if transitioned {
            warn!("{} no longer exists in the store", self.describe());
            if let Some(index) = self.context.index() {
                index.remove(self);
            }
        }
    }

    // ========================================
    // Commit / rollback
    // ========================================

    fn needs_write(&self, working: &DataSnapshot) -> bool {
        self.committed
            .load()
            .is_none_or(|c| working.changed(&c) || c.version() != working.version())
    }

    fn publish(&self, overlay: &TransactionOverlay) -> Result<()> {
        let working = self.working_of(overlay)?;
        let prior = self.persistence_state();
        let previous = self.committed.load();
        let index = self.context.index();

        if overlay.target_state().is_deleted() {
            let token = self.context.update_count.bump();
            P::reconcile(&self.context.tracker, &self.key, &working, None)?;
            if P::DATED {
                // identity stays; 0 is never current after the bump, so the
                // next read re-resolves the key
                self.committed
                    .store(Some(Arc::new((*working).clone().with_data_version(0))));
                debug!("{} retired its window at update count {}", self.describe(), token);
                return Ok(());
            }
            self.state.store(PersistenceState::Deleted as u8, Ordering::Release);
            if let Some(index) = &index {
                index.remove(self);
            }
            debug!("{} removed", self.describe());
            return Ok(());
        }

        if prior != PersistenceState::InMemory && !self.needs_write(&working) {
            return Ok(());
        }

        let token = self.context.update_count.bump();
        let published = Arc::new(
            (*working)
                .clone()
                .with_version(working.version() + 1)
                .with_data_version(token),
        );
        self.committed.store(Some(Arc::clone(&published)));
        self.state.store(overlay.target_state() as u8, Ordering::Release);

        if let Some(index) = &index {
            if prior == PersistenceState::InMemory {
                if let Some(this) = self.this.upgrade() {
                    index.register(this);
                }
            } else if let Some(previous) = &previous {
                if previous.changed(&published) {
                    index.reindex_on_change(self, previous, &published);
                }
            }
        }

        P::reconcile(&self.context.tracker, &self.key, &working, Some(&published))
    }

    /// Give up an exclusive claim `tx` took moments ago, discarding its
    /// working copy. A former sole reader keeps its shared claim.
    fn abandon_write(&self, tx: &Arc<Coordinator>, was_reader: bool) {
        let Some(current) = self.overlay.load().filter(|o| o.is_writer(tx.id())) else {
            return;
        };
        let next = was_reader
            .then(|| Arc::new(TransactionOverlay::shared(Arc::clone(tx), self.persistence_state())));
        if !self.overlay.compare_and_set(Some(&current), next) {
            warn!("{}: claim on {} changed while giving it up", tx.id(), self.describe());
            return;
        }
        if let Ok(object) = self.as_object() {
            tx.withdraw_write(&object, was_reader);
        }
        debug!("{} gave up its write claim on {}", tx.id(), self.describe());
    }

    /// Drop the claim of `id`, clearing the overlay when it was the last one.
    fn release(&self, id: CoordinatorId) {
        loop {
            let Some(current) = self.overlay.load() else {
                return;
            };
            if !current.is_participant(id) {
                return;
            }
            let next = current.without(id).map(Arc::new);
            if self.overlay.compare_and_set(Some(&current), next) {
                return;
            }
            std::hint::spin_loop();
        }
    }

    // ========================================
    // Helpers
    // ========================================

    fn as_object(&self) -> Result<Arc<dyn TransactionalObject>> {
        match self.this.upgrade() {
            Some(this) => Ok(this as Arc<dyn TransactionalObject>),
            None => Err(CacheError::InvariantViolation(format!(
                "{} is being dropped",
                self.describe()
            ))),
        }
    }

    fn working_of(&self, overlay: &TransactionOverlay) -> Result<Arc<DataSnapshot>> {
        overlay.working().cloned().ok_or_else(|| {
            CacheError::InvariantViolation(format!("{} has no working copy", self.describe()))
        })
    }

    fn committed_or_deleted(&self) -> Result<Arc<DataSnapshot>> {
        self.committed
            .load()
            .ok_or_else(|| CacheError::ObjectDeleted(self.describe()))
    }

    fn ensure_not_deleted(&self) -> Result<()> {
        if self.persistence_state().is_deleted() {
            return Err(CacheError::ObjectDeleted(self.describe()));
        }
        Ok(())
    }

    fn ensure_in_memory(&self) -> Result<()> {
        match self.persistence_state() {
            PersistenceState::InMemory => Ok(()),
            state => Err(CacheError::InvalidTransactionState(format!(
                "{} is already {}",
                self.describe(),
                state
            ))),
        }
    }

    fn ensure_persisted(&self) -> Result<()> {
        match self.persistence_state() {
            PersistenceState::Persisted => Ok(()),
            PersistenceState::Deleted => Err(CacheError::ObjectDeleted(self.describe())),
            PersistenceState::InMemory => Err(CacheError::InvalidTransactionState(format!(
                "{} was never inserted",
                self.describe()
            ))),
        }
    }

    fn would_block(&self, blocker: Arc<Coordinator>) -> CacheError {
        CacheError::WouldBlock {
            key: self.describe(),
            blocker,
        }
    }

    fn not_write_enrolled(&self, tx: &Coordinator) -> CacheError {
        CacheError::InvalidTransactionState(format!(
            "{} is not write-enrolled by {}",
            self.describe(),
            tx.id()
        ))
    }

    fn not_found_at(&self, date: BusinessDate) -> CacheError {
        CacheError::NotFound(format!("{} as of {}", self.describe(), date.to_rfc3339()))
    }
}

impl<P: TemporalPolicy> TransactionalObject for PersistentHandle<P> {
    fn describe(&self) -> String {
        PersistentHandle::describe(self)
    }

    fn flush(&self, coordinator: &Coordinator, batch: &mut FlushBatch) -> Result<()> {
        let Some(overlay) = self.overlay.load() else {
            return Ok(());
        };
        if !overlay.is_writer(coordinator.id()) {
            return Ok(());
        }
        let working = self.working_of(&overlay)?;
        let outgoing = (*working).clone().with_version(working.version() + 1);

        let write = match (self.persistence_state(), overlay.target_state()) {
            (PersistenceState::InMemory, PersistenceState::Deleted) => None,
            (PersistenceState::InMemory, _) => Some(StoreWrite::Insert(outgoing)),
            (_, PersistenceState::Deleted) => Some(P::removal((*working).clone())),
            _ if self.needs_write(&working) => Some(StoreWrite::Update {
                row: outgoing,
                expected_version: working.version(),
            }),
            _ => None,
        };

        if let Some(write) = write {
            batch.push(&self.context.gateway, &self.context.update_count, write);
        }
        Ok(())
    }

    fn commit(&self, coordinator: &Coordinator) {
        let Some(overlay) = self.overlay.load() else {
            return;
        };
        if overlay.is_writer(coordinator.id()) {
            if let Err(err) = self.publish(&overlay) {
                error!(
                    "{}: reconciling {} after commit failed: {}",
                    coordinator.id(),
                    self.describe(),
                    err
                );
            }
        }
        self.release(coordinator.id());
    }

    fn rollback(&self, coordinator: &Coordinator) {
        self.release(coordinator.id());
    }
}

impl<P: TemporalPolicy> std::fmt::Debug for PersistentHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentHandle")
            .field("key", &self.describe())
            .field("state", &self.persistence_state())
            .field("writer", &self.writer())
            .field("readers", &self.readers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryObjectIndex;
    use crate::config::CacheConfig;
    use crate::object::NonDated;
    use crate::storage::InMemoryStore;
    use crate::transaction::TransactionManager;

    struct Fixture {
        store: Arc<InMemoryStore>,
        index: Arc<dyn ObjectIndex<NonDated>>,
        context: Arc<TypeContext<NonDated>>,
        manager: TransactionManager,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new("order");
        let index: Arc<dyn ObjectIndex<NonDated>> = Arc::new(InMemoryObjectIndex::new());
        let context = Arc::new(TypeContext::new(
            "order",
            store.clone(),
            Arc::new(PerClassUpdateCountHolder::new()),
            Arc::new(TemporalWindowTracker::new()),
            &index,
            64,
        ));
        Fixture {
            store,
            index,
            context,
            manager: TransactionManager::new(CacheConfig::default()),
        }
    }

    fn persisted(f: &Fixture, id: i64, qty: i64) -> Arc<PersistentHandle<NonDated>> {
        let row = DataSnapshot::new(PrimaryKey::from(id)).with_attribute("qty", qty);
        f.store.put_external(row).unwrap();
        let fetched = f.store.fetch(&PrimaryKey::from(id)).unwrap().unwrap();
        let handle = PersistentHandle::materialize(Arc::clone(&f.context), fetched);
        f.index.register(handle)
    }

    #[test]
    fn test_overlay_cleared_after_commit_and_rollback() {
        let f = fixture();
        let handle = persisted(&f, 1, 5);

        let tx = f.manager.begin().unwrap();
        handle.set_attribute(&tx, "qty", 6i64).unwrap();
        assert!(handle.is_enrolled());
        tx.commit().unwrap();
        assert!(!handle.is_enrolled());

        let tx = f.manager.begin().unwrap();
        handle.set_attribute(&tx, "qty", 7i64).unwrap();
        tx.rollback().unwrap();
        assert!(!handle.is_enrolled());
        assert_eq!(handle.get("qty").unwrap(), Some(Value::Integer(6)));
    }

    #[test]
    fn test_commit_bumps_version_only_on_change() {
        let f = fixture();
        let handle = persisted(&f, 1, 5);
        let before = handle.committed().unwrap().version();

        let tx = f.manager.begin().unwrap();
        handle.lock_for_write(&tx).unwrap();
        tx.commit().unwrap();
        assert_eq!(handle.committed().unwrap().version(), before);

        let tx = f.manager.begin().unwrap();
        handle.set_attribute(&tx, "qty", 9i64).unwrap();
        tx.commit().unwrap();
        assert_eq!(handle.committed().unwrap().version(), before + 1);
        assert_eq!(f.store.row(handle.key()).unwrap().version(), before + 1);
    }

    #[test]
    fn test_handle_commit_is_idempotent() {
        let f = fixture();
        let handle = persisted(&f, 1, 5);
        let tx = f.manager.begin().unwrap();
        handle.set_attribute(&tx, "qty", 6i64).unwrap();

        let coordinator = Arc::clone(tx.coordinator());
        TransactionalObject::commit(handle.as_ref(), &coordinator);
        let published = handle.committed().unwrap();
        TransactionalObject::commit(handle.as_ref(), &coordinator);

        assert!(Arc::ptr_eq(&published, &handle.committed().unwrap()));
        assert!(!handle.is_enrolled());
    }

    #[test]
    fn test_refresh_detects_removed_row() {
        let f = fixture();
        let handle = persisted(&f, 1, 5);

        f.store.remove_external(handle.key()).unwrap();
        f.context.update_count().bump();

        assert!(matches!(
            handle.read(),
            Err(CacheError::DeletedConcurrently(_))
        ));
        assert_eq!(handle.persistence_state(), PersistenceState::Deleted);
        assert!(f.index.resolve(handle.key()).is_none());
        assert!(matches!(handle.read(), Err(CacheError::ObjectDeleted(_))));
    }

    #[test]
    fn test_non_dated_window_operations_are_refused() {
        let f = fixture();
        let handle = persisted(&f, 1, 5);
        let tx = f.manager.begin().unwrap();

        assert!(matches!(
            handle.terminate(&tx),
            Err(CacheError::InvariantViolation(_))
        ));
        assert!(!handle.is_enrolled());
    }
}
