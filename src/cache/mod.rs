pub mod index;
pub mod update_count;
pub mod window;

pub use index::{InMemoryObjectIndex, ObjectIndex};
pub use update_count::PerClassUpdateCountHolder;
pub use window::TemporalWindowTracker;
