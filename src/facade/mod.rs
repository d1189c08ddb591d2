pub mod cache;
pub mod object_type;

pub use cache::CacheManager;
pub use object_type::ObjectType;
