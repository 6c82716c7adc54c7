// tests/stores.rs

use std::time::{Duration, SystemTime};

use fieldgen::engine::FieldSpec;
use fieldgen::store::{
    FieldCatalog, FlagStore, LeaseStore, LeaseToken, MemoryCatalog, MemoryKv,
    MemoryScheduledUpdates, ScheduledUpdateStore, flag_key, lease_key,
};
use fieldgen_test_utils::builders::field_spec;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[test]
fn keys_are_namespaced_per_field() {
    assert_eq!(lease_key(7), "fieldgen:lease:7");
    assert_eq!(flag_key(7), "fieldgen:reschedule:7");
    assert_ne!(lease_key(7), lease_key(8));
}

#[tokio::test(start_paused = true)]
async fn lease_is_exclusive_until_released_or_expired() {
    let kv = MemoryKv::new();
    let key = lease_key(1);

    let first = kv.acquire(&key, secs(10)).await.unwrap().expect("lease is free");
    assert_eq!(kv.acquire(&key, secs(10)).await.unwrap(), None);
    assert!(kv.is_held(&key).await.unwrap());

    assert!(kv.release(&key, first).await.unwrap());
    assert!(!kv.is_held(&key).await.unwrap());
    let second = kv.acquire(&key, secs(10)).await.unwrap().expect("released");
    assert_ne!(first, second);

    tokio::time::advance(secs(11)).await;
    assert!(!kv.is_held(&key).await.unwrap());
    assert!(kv.acquire(&key, secs(10)).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn renew_extends_only_a_live_lease() {
    let kv = MemoryKv::new();
    let key = lease_key(1);

    assert!(!kv.renew(&key, LeaseToken::new(99), secs(10)).await.unwrap());
    let token = kv.acquire(&key, secs(10)).await.unwrap().expect("lease is free");

    tokio::time::advance(secs(8)).await;
    assert!(kv.renew(&key, token, secs(10)).await.unwrap());
    tokio::time::advance(secs(8)).await;
    assert!(kv.is_held(&key).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn expired_holder_cannot_touch_the_next_lease() {
    let kv = MemoryKv::new();
    let key = lease_key(1);

    let stale = kv.acquire(&key, secs(10)).await.unwrap().expect("lease is free");
    tokio::time::advance(secs(11)).await;
    let current = kv.acquire(&key, secs(10)).await.unwrap().expect("lease expired");

    assert!(!kv.renew(&key, stale, secs(10)).await.unwrap());
    assert!(!kv.release(&key, stale).await.unwrap());
    assert!(kv.is_held(&key).await.unwrap());

    assert!(kv.release(&key, current).await.unwrap());
    assert!(!kv.is_held(&key).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn flag_test_and_clear_consumes_it_once() {
    let kv = MemoryKv::new();
    let key = flag_key(1);

    assert!(!kv.test_and_clear(&key).await.unwrap());
    kv.set(&key, secs(60)).await.unwrap();
    kv.set(&key, secs(60)).await.unwrap();
    assert!(kv.is_set(&key).await.unwrap());

    assert!(kv.test_and_clear(&key).await.unwrap());
    assert!(!kv.test_and_clear(&key).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn expired_flag_reads_as_unset() {
    let kv = MemoryKv::new();
    let key = flag_key(1);

    kv.set(&key, secs(60)).await.unwrap();
    tokio::time::advance(secs(61)).await;
    assert!(!kv.is_set(&key).await.unwrap());
    assert!(!kv.test_and_clear(&key).await.unwrap());
}

#[tokio::test]
async fn upsert_keeps_one_record_with_the_latest_time() {
    let updates = MemoryScheduledUpdates::new();
    let t0 = SystemTime::now();
    let t1 = t0 + secs(5);

    updates.upsert(1, &[3, 4], t0).await.unwrap();
    updates.upsert(1, &[3], t1).await.unwrap();
    updates.upsert(1, &[4], t0 - secs(5)).await.unwrap();

    assert_eq!(updates.len(), 2);
    assert_eq!(updates.updated_on(1, 3), Some(t1));
    assert_eq!(updates.updated_on(1, 4), Some(t0));
}

#[tokio::test]
async fn remove_if_untouched_respects_run_start() {
    let updates = MemoryScheduledUpdates::new();
    let run_start = SystemTime::now();

    updates.upsert(1, &[1], run_start - secs(1)).await.unwrap();
    updates.upsert(1, &[2], run_start + secs(1)).await.unwrap();
    updates.upsert(1, &[3], run_start).await.unwrap();

    assert!(updates.remove_if_untouched(1, 1, run_start).await.unwrap());
    assert!(!updates.remove_if_untouched(1, 2, run_start).await.unwrap());
    assert!(updates.remove_if_untouched(1, 3, run_start).await.unwrap());
    // No record at all counts as touched: the value must not be written.
    assert!(!updates.remove_if_untouched(1, 9, run_start).await.unwrap());

    assert_eq!(updates.rows_for(1), vec![2]);
}

#[tokio::test]
async fn scheduled_row_ids_page_in_ascending_order() {
    let updates = MemoryScheduledUpdates::new();
    updates
        .upsert(1, &[9, 2, 5, 7], SystemTime::now())
        .await
        .unwrap();
    updates.upsert(2, &[1], SystemTime::now()).await.unwrap();

    assert_eq!(updates.scheduled_row_ids(1, None, 3).await.unwrap(), vec![2, 5, 7]);
    assert_eq!(updates.scheduled_row_ids(1, Some(7), 3).await.unwrap(), vec![9]);
    assert!(updates.scheduled_row_ids(1, Some(9), 3).await.unwrap().is_empty());
    assert!(updates.has_pending(2).await.unwrap());
    assert!(!updates.has_pending(3).await.unwrap());
}

#[tokio::test]
async fn deletes_by_age_and_by_field() {
    let updates = MemoryScheduledUpdates::new();
    let now = SystemTime::now();
    updates.upsert(1, &[1, 2], now - secs(100)).await.unwrap();
    updates.upsert(1, &[3], now).await.unwrap();
    updates.upsert(2, &[1, 2], now).await.unwrap();
    updates.upsert(3, &[1], now).await.unwrap();

    assert_eq!(updates.delete_older_than(now - secs(50)).await.unwrap(), 2);
    assert_eq!(updates.pending_fields().await.unwrap(), vec![1, 2, 3]);

    assert_eq!(updates.delete_for_field(2).await.unwrap(), 2);
    assert_eq!(updates.delete_for_field(2).await.unwrap(), 0);
    assert_eq!(updates.pending_fields().await.unwrap(), vec![1, 3]);
}

#[tokio::test]
async fn catalog_toggles_auto_update() {
    let catalog = MemoryCatalog::new([field_spec(1, "echo", "echo")]);

    assert!(catalog.set_auto_update(1, false).await.unwrap());
    let field: FieldSpec = catalog.field(1).await.unwrap().expect("field 1 exists");
    assert!(!field.auto_update);

    assert!(!catalog.set_auto_update(2, true).await.unwrap());
    assert!(catalog.field(2).await.unwrap().is_none());

    catalog.insert(field_spec(2, "echo", "echo"));
    assert_eq!(catalog.fields().await.unwrap().len(), 2);
    assert!(catalog.remove(1).is_some());
    assert_eq!(catalog.fields().await.unwrap().len(), 1);
}
