#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use txcache::{
    BusinessDate, CacheConfig, CacheManager, DataSnapshot, Dated, InMemoryStore, NonDated,
    ObjectType, PrimaryKey, ValidityWindow, Value,
};

pub struct Fixture<P: txcache::TemporalPolicy> {
    pub cache: CacheManager,
    pub store: Arc<InMemoryStore>,
    pub objects: Arc<ObjectType<P>>,
}

pub fn quick_config() -> CacheConfig {
    CacheConfig::default()
        .transaction_timeout(Duration::from_secs(5))
        .retry_backoff(Duration::from_millis(1))
}

/// Plain `order` type over an empty store
pub fn orders() -> Fixture<NonDated> {
    orders_with(quick_config())
}

pub fn orders_with(config: CacheConfig) -> Fixture<NonDated> {
    let cache = CacheManager::new(config).unwrap();
    let store = InMemoryStore::new("order");
    let objects = cache
        .register_indexed_type::<NonDated>("order", store.clone(), &["status"])
        .unwrap();
    Fixture { cache, store, objects }
}

/// Dated `price` type over an empty store
pub fn prices() -> Fixture<Dated> {
    let cache = CacheManager::new(quick_config()).unwrap();
    let store = InMemoryStore::dated("price");
    let objects = cache.register_type::<Dated>("price", store.clone()).unwrap();
    Fixture { cache, store, objects }
}

/// Write an order row behind the cache's back; returns the stored version.
pub fn seed_order(store: &InMemoryStore, id: i64, qty: i64) -> u64 {
    store
        .put_external(
            DataSnapshot::new(PrimaryKey::from(id))
                .with_attribute("qty", qty)
                .with_attribute("status", "open"),
        )
        .unwrap()
}

/// Write a price window behind the cache's back.
pub fn seed_price(store: &InMemoryStore, id: i64, amount: i64, from: BusinessDate, thru: BusinessDate) -> u64 {
    store
        .put_external(
            DataSnapshot::new(PrimaryKey::from(id))
                .with_attribute("amount", amount)
                .with_window(ValidityWindow::new(from, thru).unwrap()),
        )
        .unwrap()
}

pub fn day(d: u32) -> BusinessDate {
    Utc.with_ymd_and_hms(2024, 3, d, 0, 0, 0).unwrap()
}

pub fn int(snapshot: &DataSnapshot, attribute: &str) -> i64 {
    snapshot
        .get(attribute)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("{} is not an integer in {:?}", attribute, snapshot))
}
