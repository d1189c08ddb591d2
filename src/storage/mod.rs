pub mod catalog;
pub mod gateway;
pub mod memory;

pub use catalog::{Catalog, TypeEntry};
pub use gateway::{PersistenceGateway, RowImage, StoreWrite};
pub use memory::{InMemoryStore, StoreStats};
