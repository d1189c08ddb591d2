use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// A nullable shared pointer cell with compare-and-set.
///
/// Reads are lock-free; comparison is by `Arc` identity, never by value.
pub struct AtomicSlot<T> {
    inner: ArcSwapOption<T>,
}

fn same<T>(left: &Option<Arc<T>>, right: &Option<Arc<T>>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(left), Some(right)) => Arc::ptr_eq(left, right),
        _ => false,
    }
}

impl<T> AtomicSlot<T> {
    pub fn new(value: Option<Arc<T>>) -> Self {
        Self {
            inner: ArcSwapOption::new(value),
        }
    }

    pub fn empty() -> Self {
        Self::new(None)
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.inner.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_none()
    }

    /// Install `new` if the cell still holds `expected` (`None` = empty).
    pub fn compare_and_set(&self, expected: Option<&Arc<T>>, new: Option<Arc<T>>) -> bool {
        let expected = expected.cloned();
        let previous = self.inner.compare_and_swap(&expected, new);
        same(&*previous, &expected)
    }

    /// Unconditionally replace the content.
    pub fn store(&self, new: Option<Arc<T>>) {
        self.inner.store(new);
    }
}

impl<T: fmt::Debug> fmt::Debug for AtomicSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicSlot").field(&self.load()).finish()
    }
}
