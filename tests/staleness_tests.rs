/// Staleness tests
///
/// Tests for update-count based cache coherency on the non-transactional
/// read path and before writes
/// Run with: cargo test --test staleness_tests

mod common;

use common::{int, orders, seed_order};
use txcache::{CacheError, DataSnapshot, PersistenceState, PrimaryKey};

#[test]
fn test_fresh_read_does_not_fetch() {
    let f = orders();
    seed_order(&f.store, 1, 5);
    let order = f.objects.find(1).unwrap();
    let fetches = f.store.stats().fetches;

    for _ in 0..10 {
        assert_eq!(int(&order.read().unwrap(), "qty"), 5);
    }
    assert_eq!(f.store.stats().fetches, fetches);
}

#[test]
fn test_external_write_is_seen_after_invalidation() {
    let f = orders();
    seed_order(&f.store, 1, 5);
    let order = f.objects.find(1).unwrap();

    seed_order(&f.store, 1, 42);
    // nothing told the cache yet
    assert_eq!(int(&order.read().unwrap(), "qty"), 5);

    f.objects.invalidate();
    let fresh = order.read().unwrap();
    assert_eq!(int(&fresh, "qty"), 42);
    assert_eq!(fresh.version(), 2);
    assert!(f.objects.update_count().is_current(fresh.data_version()));
}

#[test]
fn test_commit_makes_other_objects_of_the_type_stale() {
    let f = orders();
    seed_order(&f.store, 1, 5);
    seed_order(&f.store, 2, 5);
    let first = f.objects.find(1).unwrap();
    let second = f.objects.find(2).unwrap();
    let before = f.objects.update_count().current_count();

    let tx = f.cache.begin().unwrap();
    first.set_attribute(&tx, "qty", 6i64).unwrap();
    tx.commit().unwrap();

    assert_eq!(f.objects.update_count().current_count(), before + 1);
    // the committing object publishes with the new token
    let fetches = f.store.stats().fetches;
    first.read().unwrap();
    assert_eq!(f.store.stats().fetches, fetches);
    // others re-fetch once
    second.read().unwrap();
    second.read().unwrap();
    assert_eq!(f.store.stats().fetches, fetches + 1);
}

#[test]
fn test_externally_removed_object_is_unlinked() {
    let f = orders();
    seed_order(&f.store, 1, 5);
    let order = f.objects.find(1).unwrap();

    f.store.remove_external(&PrimaryKey::from(1)).unwrap();
    f.objects.invalidate();

    assert!(matches!(order.read(), Err(CacheError::DeletedConcurrently(_))));
    assert_eq!(order.persistence_state(), PersistenceState::Deleted);
    assert!(f.objects.is_empty());
    assert!(matches!(f.objects.find(1), Err(CacheError::NotFound(_))));
}

#[test]
fn test_write_refreshes_stale_base_first() {
    let f = orders();
    seed_order(&f.store, 1, 5);
    let order = f.objects.find(1).unwrap();

    seed_order(&f.store, 1, 20);
    f.objects.invalidate();

    let tx = f.cache.begin().unwrap();
    let base = order.read_in(&tx).unwrap();
    assert_eq!(int(&base, "qty"), 20);
    order.set_attribute(&tx, "note", "checked").unwrap();
    tx.commit().unwrap();

    let row = f.store.row(&PrimaryKey::from(1)).unwrap();
    assert_eq!(int(&row, "qty"), 20);
    assert_eq!(row.version(), 3);
}

#[test]
fn test_unnoticed_external_write_fails_then_retry_succeeds() {
    let f = orders();
    seed_order(&f.store, 1, 5);
    let order = f.objects.find(1).unwrap();
    seed_order(&f.store, 1, 20);

    let mut attempts = 0;
    let qty = f
        .cache
        .execute("restock", |tx| {
            attempts += 1;
            let current = int(&*order.read_in(tx)?, "qty");
            order.set_attribute(tx, "qty", current + 1)?;
            Ok(current + 1)
        })
        .unwrap();

    // first attempt wrote over version 1 and was refused by the store
    assert_eq!(attempts, 2);
    assert_eq!(qty, 21);
    assert_eq!(int(&f.store.row(&PrimaryKey::from(1)).unwrap(), "qty"), 21);
    assert_eq!(f.cache.transactions().stats().retries, 1);
}

#[test]
fn test_stale_write_surfaces_optimistic_lock_failure() {
    let f = orders();
    seed_order(&f.store, 1, 5);
    let order = f.objects.find(1).unwrap();
    f.store
        .put_external(DataSnapshot::new(PrimaryKey::from(1)).with_attribute("qty", 99i64))
        .unwrap();
    let count = f.objects.update_count().current_count();

    let tx = f.cache.begin().unwrap();
    order.set_attribute(&tx, "qty", 6i64).unwrap();
    assert!(matches!(
        tx.commit(),
        Err(CacheError::OptimisticLockFailure { expected: 1, actual: 2, .. })
    ));
    assert!(f.objects.update_count().current_count() > count);
    assert_eq!(int(&order.read().unwrap(), "qty"), 99);
}
