use std::sync::{Arc, RwLock};

use log::info;

use crate::config::CacheConfig;
use crate::core::Result;
use crate::object::TemporalPolicy;
use crate::storage::{Catalog, PersistenceGateway};
use crate::transaction::{ParticipationMode, Transaction, TransactionManager};

use super::ObjectType;

/// Entry point: one catalog of business types sharing one transaction
/// manager.
pub struct CacheManager {
    config: CacheConfig,
    /// Catalog - просто значение под RwLock, регистрация подменяет его целиком
    catalog: RwLock<Catalog>,
    transactions: TransactionManager,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transactions: TransactionManager::new(config.clone()),
            catalog: RwLock::new(Catalog::new()),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current catalog; cheap to clone and never changes underneath
    pub fn catalog(&self) -> Result<Catalog> {
        Ok(self.catalog.read()?.clone())
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Register a business type backed by `gateway`.
    pub fn register_type<P: TemporalPolicy>(
        &self,
        name: &str,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Result<Arc<ObjectType<P>>> {
        self.register_indexed_type(name, gateway, &[])
    }

    /// Register a business type with secondary indices on `attributes`.
    pub fn register_indexed_type<P: TemporalPolicy>(
        &self,
        name: &str,
        gateway: Arc<dyn PersistenceGateway>,
        attributes: &[&str],
    ) -> Result<Arc<ObjectType<P>>> {
        let mut catalog = self.catalog.write()?;
        let next = catalog.clone().with_type(name, P::DATED)?;
        let update_count = Arc::clone(&next.get_type(name)?.update_count);
        *catalog = next;

        info!("registered {} type {}", if P::DATED { "dated" } else { "plain" }, name);
        Ok(Arc::new(ObjectType::new(
            name,
            gateway,
            update_count,
            &self.config,
            attributes,
        )))
    }

    pub fn unregister_type(&self, name: &str) -> Result<()> {
        let mut catalog = self.catalog.write()?;
        *catalog = catalog.clone().without_type(name)?;
        Ok(())
    }

    pub fn begin(&self) -> Result<Transaction> {
        self.transactions.begin()
    }

    pub fn begin_optimistic(&self, name: &str) -> Result<Transaction> {
        self.transactions
            .begin_with(name.to_string(), ParticipationMode::OptimisticLocking)
    }

    /// See [`TransactionManager::execute`].
    pub fn execute<T, F>(&self, name: &str, work: F) -> Result<T>
    where
        F: FnMut(&Transaction) -> Result<T>,
    {
        self.transactions.execute(name, work)
    }
}
