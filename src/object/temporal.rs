// ============================================================================
// Temporal Policy
// ============================================================================
//
// The handle state machine is shared by plain and dated objects. What
// differs is expressed here:
//
//   NonDated: delete removes the row; window edits are refused
//   Dated:    delete is refused; terminate cuts the validity window at the
//             object's business date and every publish is reconciled into
//             the window tracker. History is never dropped: a window that
//             starts at the cut is retired in the store.
//
// ============================================================================

use std::sync::Arc;

use chrono::Utc;

use crate::cache::TemporalWindowTracker;
use crate::core::{BusinessDate, CacheError, DataSnapshot, PrimaryKey, Result, ValidityWindow};
use crate::storage::{PersistenceGateway, StoreWrite};

/// Outcome of terminating the working copy at a business date
#[derive(Debug, Clone, PartialEq)]
pub enum WindowEdit {
    /// Window shortened; the object stays valid up to the new `thru`
    Closed(DataSnapshot),
    /// The window starts at the cut and is retired as a whole
    Retired,
}

pub trait TemporalPolicy: Send + Sync + Sized + 'static {
    const DATED: bool;

    fn check_delete(object: &str) -> Result<()>;

    /// Set `thru` of the working window to `until`.
    fn close_window(working: &DataSnapshot, until: BusinessDate, object: &str) -> Result<DataSnapshot>;

    /// End validity at the business date `as_of`.
    fn terminate_at(working: &DataSnapshot, as_of: BusinessDate, object: &str) -> Result<WindowEdit>;

    fn open_window(working: &DataSnapshot, until: BusinessDate, object: &str) -> Result<DataSnapshot>;

    /// Store write removing (plain) or retiring (dated) `snapshot`.
    fn removal(snapshot: DataSnapshot) -> StoreWrite;

    fn fetch(
        gateway: &dyn PersistenceGateway,
        key: &PrimaryKey,
        as_of: Option<BusinessDate>,
    ) -> Result<Option<DataSnapshot>>;

    /// Follow a publish (`Some`) or a removal (`None`) in the window tracker.
    fn reconcile(
        tracker: &TemporalWindowTracker,
        key: &PrimaryKey,
        removed: &DataSnapshot,
        published: Option<&Arc<DataSnapshot>>,
    ) -> Result<()>;
}

/// Objects without business time
#[derive(Debug, Clone, Copy, Default)]
pub struct NonDated;

/// Objects carrying a `[from, thru)` validity window
#[derive(Debug, Clone, Copy, Default)]
pub struct Dated;

fn window_of<'a>(snapshot: &'a DataSnapshot, object: &str) -> Result<&'a ValidityWindow> {
    snapshot
        .window()
        .ok_or_else(|| CacheError::InvariantViolation(format!("{} has no validity window", object)))
}

fn not_dated(object: &str, operation: &str) -> CacheError {
    CacheError::InvariantViolation(format!(
        "{} of {} requires a dated object",
        operation, object
    ))
}

impl TemporalPolicy for NonDated {
    const DATED: bool = false;

    fn check_delete(_object: &str) -> Result<()> {
        Ok(())
    }

    fn close_window(_working: &DataSnapshot, _until: BusinessDate, object: &str) -> Result<DataSnapshot> {
        Err(not_dated(object, "terminate"))
    }

    fn terminate_at(_working: &DataSnapshot, _as_of: BusinessDate, object: &str) -> Result<WindowEdit> {
        Err(not_dated(object, "terminate"))
    }

    fn open_window(_working: &DataSnapshot, _until: BusinessDate, object: &str) -> Result<DataSnapshot> {
        Err(not_dated(object, "insert until"))
    }

    fn removal(snapshot: DataSnapshot) -> StoreWrite {
        StoreWrite::Delete(snapshot)
    }

    fn fetch(
        gateway: &dyn PersistenceGateway,
        key: &PrimaryKey,
        _as_of: Option<BusinessDate>,
    ) -> Result<Option<DataSnapshot>> {
        gateway.fetch(key)
    }

    fn reconcile(
        _tracker: &TemporalWindowTracker,
        _key: &PrimaryKey,
        _removed: &DataSnapshot,
        _published: Option<&Arc<DataSnapshot>>,
    ) -> Result<()> {
        Ok(())
    }
}

impl TemporalPolicy for Dated {
    const DATED: bool = true;

    fn check_delete(object: &str) -> Result<()> {
        Err(CacheError::InvariantViolation(format!(
            "dated objects must not be deleted, terminate {} instead",
            object
        )))
    }

    fn close_window(working: &DataSnapshot, until: BusinessDate, object: &str) -> Result<DataSnapshot> {
        let window = window_of(working, object)?;
        if until > window.thru() {
            return Err(CacheError::InvariantViolation(format!(
                "terminate of {} at {} would extend its window {}",
                object,
                until.to_rfc3339(),
                window
            )));
        }

        let mut edited = working.clone();
        edited.set_window(window.with_thru(until)?);
        Ok(edited)
    }

    fn terminate_at(working: &DataSnapshot, as_of: BusinessDate, object: &str) -> Result<WindowEdit> {
        let window = window_of(working, object)?;
        if as_of >= window.thru() {
            return Err(CacheError::InvariantViolation(format!(
                "{} is not valid at {}, its window is {}",
                object,
                as_of.to_rfc3339(),
                window
            )));
        }
        if as_of <= window.from() {
            return Ok(WindowEdit::Retired);
        }
        Self::close_window(working, as_of, object).map(WindowEdit::Closed)
    }

    fn open_window(working: &DataSnapshot, until: BusinessDate, object: &str) -> Result<DataSnapshot> {
        let window = window_of(working, object)?;
        let mut edited = working.clone();
        edited.set_window(window.with_thru(until)?);
        Ok(edited)
    }

    fn removal(snapshot: DataSnapshot) -> StoreWrite {
        StoreWrite::Terminate(snapshot)
    }

    fn fetch(
        gateway: &dyn PersistenceGateway,
        key: &PrimaryKey,
        as_of: Option<BusinessDate>,
    ) -> Result<Option<DataSnapshot>> {
        gateway.fetch_as_of(key, as_of.unwrap_or_else(Utc::now))
    }

    fn reconcile(
        tracker: &TemporalWindowTracker,
        key: &PrimaryKey,
        removed: &DataSnapshot,
        published: Option<&Arc<DataSnapshot>>,
    ) -> Result<()> {
        match published {
            Some(snapshot) => tracker.reconcile(key, Arc::clone(snapshot)),
            None => {
                if let Some(window) = removed.window() {
                    tracker.remove_window(key, window.from())?;
                }
                Ok(())
            }
        }
    }
}
