use crate::core::{BusinessDate, DataSnapshot, PrimaryKey, Result};

/// One row change produced by a coordinator's flush pass
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    Insert(DataSnapshot),
    /// Replace the row; the stored one must still be at `expected_version`
    Update {
        row: DataSnapshot,
        expected_version: u64,
    },
    /// Remove the row; its stored version must equal the snapshot's
    Delete(DataSnapshot),
    /// Retire the validity window the snapshot carries
    Terminate(DataSnapshot),
}

impl StoreWrite {
    pub fn key(&self) -> &PrimaryKey {
        self.snapshot().key()
    }

    pub fn snapshot(&self) -> &DataSnapshot {
        match self {
            StoreWrite::Insert(row)
            | StoreWrite::Update { row, .. }
            | StoreWrite::Delete(row)
            | StoreWrite::Terminate(row) => row,
        }
    }
}

/// Stored rows of one key before a batch touched them.
///
/// `rows` is empty when the key did not exist; dated stores keep the whole
/// live window history of the key and its retired windows.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub key: PrimaryKey,
    pub rows: Vec<DataSnapshot>,
    pub retired: Vec<DataSnapshot>,
}

/// Reader/writer for the backing store of one business type.
///
/// The cache calls `fetch*` to materialize and refresh objects and
/// `apply_batch` once per coordinator commit. Writes carry the version the
/// caller based its change on; a mismatch must be reported as
/// `CacheError::OptimisticLockFailure`.
pub trait PersistenceGateway: Send + Sync {
    fn fetch(&self, key: &PrimaryKey) -> Result<Option<DataSnapshot>>;

    /// Row authoritative at `date`
    fn fetch_as_of(&self, key: &PrimaryKey, date: BusinessDate) -> Result<Option<DataSnapshot>> {
        Ok(self.fetch(key)?.filter(|row| row.is_valid_at(date)))
    }

    /// Apply every write or none of them.
    ///
    /// Returns the images of the touched keys as they were before, for
    /// [`Self::restore`] should a later gateway of the same commit fail.
    fn apply_batch(&self, writes: &[StoreWrite]) -> Result<Vec<RowImage>>;

    /// Put the keys of `images` back into their recorded state.
    fn restore(&self, images: &[RowImage]) -> Result<()>;
}
