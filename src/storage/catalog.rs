use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::PerClassUpdateCountHolder;
use crate::core::{CacheError, Result};

/// Registered business type
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub name: String,
    pub dated: bool,
    pub update_count: Arc<PerClassUpdateCountHolder>,
}

/// Catalog of business types.
///
/// Immutable once built: registering a type returns a new catalog
/// (Copy-on-Write), so readers clone it without locking.
#[derive(Debug, Clone)]
pub struct Catalog {
    // Arc: дешевое клонирование, изменения создают новый HashMap
    types: Arc<HashMap<String, TypeEntry>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            types: Arc::new(HashMap::new()),
        }
    }

    /// Добавить тип - возвращает НОВЫЙ Catalog
    pub fn with_type(self, name: &str, dated: bool) -> Result<Self> {
        if self.types.contains_key(name) {
            return Err(CacheError::DuplicateKey(format!("type {}", name)));
        }

        let mut types = (*self.types).clone();
        types.insert(
            name.to_string(),
            TypeEntry {
                name: name.to_string(),
                dated,
                update_count: Arc::new(PerClassUpdateCountHolder::new()),
            },
        );

        Ok(Self {
            types: Arc::new(types),
        })
    }

    pub fn get_type(&self, name: &str) -> Result<&TypeEntry> {
        self.types
            .get(name)
            .ok_or_else(|| CacheError::NotFound(format!("type {}", name)))
    }

    pub fn type_exists(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn list_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Удалить тип - возвращает НОВЫЙ Catalog
    pub fn without_type(self, name: &str) -> Result<Self> {
        if !self.types.contains_key(name) {
            return Err(CacheError::NotFound(format!("type {}", name)));
        }

        let mut types = (*self.types).clone();
        types.remove(name);

        Ok(Self {
            types: Arc::new(types),
        })
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_on_write() {
        let empty = Catalog::new();
        let with_order = empty.clone().with_type("order", false).unwrap();

        assert!(!empty.type_exists("order"));
        assert!(with_order.type_exists("order"));
        assert!(!with_order.get_type("order").unwrap().dated);
    }

    #[test]
    fn test_duplicate_and_missing_types() {
        let catalog = Catalog::new().with_type("price", true).unwrap();
        assert!(matches!(
            catalog.clone().with_type("price", false),
            Err(CacheError::DuplicateKey(_))
        ));
        assert!(catalog.get_type("order").is_err());

        let catalog = catalog.without_type("price").unwrap();
        assert!(catalog.list_types().is_empty());
    }

    #[test]
    fn test_types_have_independent_counters() {
        let catalog = Catalog::new()
            .with_type("order", false)
            .unwrap()
            .with_type("price", true)
            .unwrap();

        catalog.get_type("order").unwrap().update_count.bump();
        assert_eq!(catalog.get_type("order").unwrap().update_count.current_count(), 1);
        assert_eq!(catalog.get_type("price").unwrap().update_count.current_count(), 0);
        assert_eq!(catalog.list_types(), vec!["order", "price"]);
    }
}
