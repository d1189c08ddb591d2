use std::sync::atomic::{AtomicU64, Ordering};

/// Per-type invalidation counter.
///
/// A cached snapshot whose staleness token differs from the current count
/// must be re-fetched before it is trusted outside a transaction.
#[derive(Debug, Default)]
pub struct PerClassUpdateCountHolder {
    count: AtomicU64,
}

impl PerClassUpdateCountHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Advance the counter and return the new value.
    pub fn bump(&self) -> u64 {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_current(&self, data_version: u64) -> bool {
        self.current_count() == data_version
    }
}
