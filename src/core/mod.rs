pub mod error;
pub mod snapshot;
pub mod types;
pub mod value;

pub use error::{CacheError, Result};
pub use snapshot::DataSnapshot;
pub use types::{BusinessDate, INFINITY, PersistenceState, PrimaryKey, ValidityWindow};
pub use value::Value;
