// ============================================================================
// Transaction Manager
// ============================================================================
//
// Starts coordinators, tracks the active ones for diagnostics and owns the
// retry policy for retriable failures.
//
// ============================================================================

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use super::{Coordinator, CoordinatorId, CoordinatorStatus, ParticipationMode};
use crate::config::CacheConfig;
use crate::core::{CacheError, Result};

type ActiveRegistry = RwLock<Arc<HashMap<CoordinatorId, Arc<Coordinator>>>>;

/// Diagnostic view of a running transaction
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: CoordinatorId,
    pub name: String,
    pub status: CoordinatorStatus,
    pub participation: ParticipationMode,
    pub enlisted: usize,
    pub duration: Duration,
}

/// Counters kept by the manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub retries: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    retries: AtomicU64,
}

pub struct TransactionManager {
    config: CacheConfig,
    // Copy-on-Write so diagnostics never block begin/finish for long
    active: Arc<ActiveRegistry>,
    counters: Arc<Counters>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl TransactionManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            active: Arc::new(RwLock::new(Arc::new(HashMap::new()))),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn begin(&self) -> Result<Transaction> {
        self.begin_with(String::new(), self.config.participation)
    }

    pub fn begin_named(&self, name: &str) -> Result<Transaction> {
        self.begin_with(name.to_string(), self.config.participation)
    }

    pub fn begin_with(&self, name: String, participation: ParticipationMode) -> Result<Transaction> {
        let config = self.config.clone().participation(participation);
        let coordinator = Coordinator::new(name, &config);

        {
            let mut active = self.active.write()?;
            let mut next = (**active).clone();
            next.insert(coordinator.id(), Arc::clone(&coordinator));
            *active = Arc::new(next);
        }
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        Ok(Transaction {
            coordinator,
            registry: Arc::clone(&self.active),
            counters: Arc::clone(&self.counters),
        })
    }

    /// Run `work` in a fresh transaction and commit it, retrying retriable
    /// failures up to `max_retries` times.
    ///
    /// Between attempts the manager waits for the transaction that blocked
    /// the previous attempt, or backs off when there is none.
    pub fn execute<T, F>(&self, name: &str, mut work: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        let mut retries_left = self.config.max_retries;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let tx = self.begin_named(name)?;
            let coordinator = Arc::clone(tx.coordinator());

            let outcome = match work(&tx) {
                Ok(value) => tx.commit().map(|_| value),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback() {
                        debug!("{}: rollback after failure: {}", coordinator.id(), rollback_err);
                    }
                    Err(err)
                }
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retriable() {
                return Err(err);
            }
            if retries_left == 0 {
                error!(
                    "{} '{}' failed after {} attempts: {}",
                    coordinator.id(),
                    name,
                    attempt,
                    err
                );
                return Err(err);
            }

            retries_left -= 1;
            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{} '{}' failed, {} retries left: {}",
                coordinator.id(),
                name,
                retries_left,
                err
            );
            self.wait_before_retrying(&coordinator, &err, attempt);
        }
    }

    fn wait_before_retrying(&self, coordinator: &Arc<Coordinator>, err: &CacheError, attempt: u32) {
        if let Some(blocker) = err.blocker() {
            // the failed attempt holds nothing anymore, so waiting cannot deadlock
            match blocker.wait_for_finish(coordinator) {
                Ok(()) => return,
                Err(wait_err) => debug!("{}: wait on {} ended: {}", coordinator.id(), blocker, wait_err),
            }
        }
        let pause = self.config.retry_backoff.saturating_mul(attempt);
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }

    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        let snapshot = match self.active.read() {
            Ok(active) => Arc::clone(&active),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        };
        let mut infos: Vec<TransactionInfo> = snapshot
            .values()
            .map(|c| TransactionInfo {
                id: c.id(),
                name: c.name().to_string(),
                status: c.status(),
                participation: c.participation(),
                enlisted: c.enlisted_count(),
                duration: c.elapsed(),
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn active_count(&self) -> usize {
        self.active.read().map(|a| a.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            started: self.counters.started.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            rolled_back: self.counters.rolled_back.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }
}

/// Scope guard of a running transaction.
///
/// Dereferences to its [`Coordinator`]; dropping a still active transaction
/// rolls it back.
pub struct Transaction {
    coordinator: Arc<Coordinator>,
    registry: Arc<ActiveRegistry>,
    counters: Arc<Counters>,
}

impl Transaction {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn commit(self) -> Result<()> {
        let result = self.coordinator.commit();
        match &result {
            Ok(()) => self.counters.committed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.rolled_back.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    pub fn rollback(self) -> Result<()> {
        self.coordinator.rollback()?;
        self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Deref for Transaction {
    type Target = Arc<Coordinator>;

    fn deref(&self) -> &Self::Target {
        &self.coordinator
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.coordinator.is_active() {
            debug!("{} dropped while active, rolling back", self.coordinator.id());
            if self.coordinator.rollback().is_ok() {
                self.counters.rolled_back.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut active = match self.registry.write() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**active).clone();
        next.remove(&self.coordinator.id());
        *active = Arc::new(next);
    }
}
