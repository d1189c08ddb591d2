use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use super::{CacheError, Result, Value};

/// Business-time instant used by dated objects.
pub type BusinessDate = DateTime<Utc>;

lazy_static! {
    /// Sentinel `thru` of a window that has not been terminated.
    pub static ref INFINITY: BusinessDate = NaiveDate::from_ymd_opt(9999, 12, 1)
        .and_then(|d| d.and_hms_opt(23, 59, 0))
        .map(|n| n.and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
}

/// Identity of one business row; may be composite.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Serialize, Deserialize)]
pub struct PrimaryKey(pub Vec<Value>);

impl PrimaryKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| v.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl From<i64> for PrimaryKey {
    fn from(id: i64) -> Self {
        Self::single(id)
    }
}

impl From<i32> for PrimaryKey {
    fn from(id: i32) -> Self {
        Self::single(i64::from(id))
    }
}

impl From<&str> for PrimaryKey {
    fn from(id: &str) -> Self {
        Self::single(id)
    }
}

/// Half-open business-date interval `[from, thru)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidityWindow {
    from: BusinessDate,
    thru: BusinessDate,
}

impl ValidityWindow {
    pub fn new(from: BusinessDate, thru: BusinessDate) -> Result<Self> {
        if from >= thru {
            return Err(CacheError::InvariantViolation(format!(
                "validity window requires from < thru, got [{}, {})",
                from.to_rfc3339(),
                thru.to_rfc3339()
            )));
        }
        Ok(Self { from, thru })
    }

    /// Window starting at `from` that is still open.
    pub fn open_from(from: BusinessDate) -> Result<Self> {
        Self::new(from, *INFINITY)
    }

    pub fn from(&self) -> BusinessDate {
        self.from
    }

    pub fn thru(&self) -> BusinessDate {
        self.thru
    }

    pub fn contains(&self, date: BusinessDate) -> bool {
        self.from <= date && date < self.thru
    }

    pub fn is_open(&self) -> bool {
        self.thru == *INFINITY
    }

    pub fn overlaps(&self, other: &ValidityWindow) -> bool {
        self.from < other.thru && other.from < self.thru
    }

    pub fn with_thru(&self, thru: BusinessDate) -> Result<Self> {
        Self::new(self.from, thru)
    }
}

impl fmt::Display for ValidityWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_open() {
            write!(f, "[{}, inf)", self.from.to_rfc3339())
        } else {
            write!(f, "[{}, {})", self.from.to_rfc3339(), self.thru.to_rfc3339())
        }
    }
}

/// Lifecycle of a cached object relative to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PersistenceState {
    /// Created in memory, not yet inserted
    InMemory = 0,
    Persisted = 1,
    Deleted = 2,
}

impl PersistenceState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::InMemory,
            1 => Self::Persisted,
            _ => Self::Deleted,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InMemory => write!(f, "IN_MEMORY"),
            Self::Persisted => write!(f, "PERSISTED"),
            Self::Deleted => write!(f, "DELETED"),
        }
    }
}
