//! Behaviour every `InventoryStore` backend must share.
//!
//! The memory backend runs on every `cargo test`. The Postgres backend runs
//! with `cargo test -- --ignored` and `DATABASE_URL` pointing at a database
//! the migrations may be applied to.

use std::sync::Arc;

use inventory_service::models::{Inventory, NewJournalEntry, RollupResult};
use inventory_service::store::{run_migrations, UnitOfWork};
use inventory_service::*;
use shared::{InventoryKey, InventorySnapshot};
use uuid::Uuid;

/// Fresh warehouse id so runs against a shared database do not collide.
fn fresh_warehouse() -> i64 {
    (Uuid::new_v4().as_u128() & 0x7fff_ffff_ffff) as i64
}

fn fresh_key(tag: &str) -> InventoryKey {
    InventoryKey::new(format!("{}-{}", tag, Uuid::new_v4()), fresh_warehouse())
}

fn base_row(key: &InventoryKey, on_hand: i32, reorder_minimum: i32) -> Inventory {
    let mut snapshot = InventorySnapshot::new(key.clone(), on_hand, 0);
    snapshot.reorder_minimum = reorder_minimum;
    Inventory::from(&snapshot)
}

async fn lock_version<S: InventoryStore>(store: &S, key: &InventoryKey) -> Option<i64> {
    store.get_lock(key).await.unwrap().map(|lock| lock.lock_count)
}

async fn lock_is_created_lazily_and_kept<S: InventoryStore>(store: &S) {
    let key = fresh_key("LOCK");
    assert_eq!(lock_version(store, &key).await, None);

    assert_eq!(store.create_lock(&key).await.unwrap().lock_count, 0);
    assert_eq!(store.create_lock(&key).await.unwrap().lock_count, 0);

    assert!(store.cas_lock(&key, 0, 1).await.unwrap());
    assert!(!store.cas_lock(&key, 0, 1).await.unwrap());
    assert_eq!(store.create_lock(&key).await.unwrap().lock_count, 1);

    assert!(store.delete_lock(&key).await.unwrap());
    assert!(!store.cas_lock(&key, 1, 2).await.unwrap());
}

async fn lost_cas_rolls_back_whole_unit<S: InventoryStore>(store: &S) {
    let key = fresh_key("CAS");
    let first = store.append_journal(&NewJournalEntry::new(&key, 1, 0)).await.unwrap();
    let second = store.append_journal(&NewJournalEntry::new(&key, 0, 1)).await.unwrap();
    store.create_lock(&key).await.unwrap();

    let mut work = UnitOfWork::new();
    work.append_journal(NewJournalEntry::new(&key, 1, 1))
        .delete_journal(vec![first, second])
        .cas_lock(key.clone(), 5, 6);
    let err = store.commit(work).await.unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(store.live_journal_ids(&key).await.unwrap(), vec![first, second]);
    assert_eq!(lock_version(store, &key).await, Some(0));
}

async fn merge_into_missing_base_rolls_back<S: InventoryStore>(store: &S) {
    let key = fresh_key("MERGE");
    let id = store.append_journal(&NewJournalEntry::new(&key, 2, 2)).await.unwrap();

    let mut work = UnitOfWork::new();
    work.delete_journal(vec![id]).merge_into_base(key.clone(), RollupResult::new(2, 2));
    assert!(store.commit(work).await.unwrap_err().is_conflict());

    assert_eq!(store.live_journal_ids(&key).await.unwrap(), vec![id]);
    assert!(store.get_base(&key).await.unwrap().is_none());
}

async fn contended_compaction_has_one_winner<S: InventoryStore>(store: Arc<S>) {
    let key = fresh_key("RACE");
    store.put_base(&base_row(&key, 10, 0)).await.unwrap();
    for (allocated, on_hand) in [(0, 5), (0, -3), (2, 0)] {
        store.append_journal(&NewJournalEntry::new(&key, allocated, on_hand)).await.unwrap();
    }
    let compactor = Compactor::new(store.clone(), RollupMode::Consolidate);

    let first = compactor.prepare(&key).await.unwrap();
    let second = compactor.prepare(&key).await.unwrap();
    assert_eq!(first.journal_ids, second.journal_ids);

    let winner = compactor.commit(first).await.unwrap();
    assert_eq!(
        winner,
        RollupOutcome::Compacted {
            rows: 3,
            sum: RollupResult::new(2, 2),
            version: 1
        }
    );
    let ids_after_winner = store.live_journal_ids(&key).await.unwrap();
    assert_eq!(ids_after_winner.len(), 1);

    assert_eq!(compactor.commit(second).await.unwrap(), RollupOutcome::Conflict);
    assert_eq!(store.live_journal_ids(&key).await.unwrap(), ids_after_winner);
    assert_eq!(lock_version(&*store, &key).await, Some(1));

    let (base, rollup) = store.inventory_with_rollup(&key).await.unwrap().unwrap();
    assert_eq!(base.quantity_on_hand, 10);
    assert_eq!(rollup, RollupResult::new(2, 2));
}

async fn merge_mode_updates_base_in_place<S: InventoryStore>(store: Arc<S>) {
    let key = fresh_key("FOLD");
    store.put_base(&base_row(&key, 10, 0)).await.unwrap();
    store.append_journal(&NewJournalEntry::new(&key, 3, -1)).await.unwrap();
    store.append_journal(&NewJournalEntry::new(&key, -1, 4)).await.unwrap();

    let compactor = Compactor::new(store.clone(), RollupMode::MergeIntoBase);
    compactor.compact(&key).await.unwrap();

    assert!(store.live_journal_ids(&key).await.unwrap().is_empty());
    let base = store.get_base(&key).await.unwrap().unwrap();
    assert_eq!(base.quantity_on_hand, 13);
    assert_eq!(base.allocated_quantity, 2);
}

async fn delete_defeats_planned_compaction<S: InventoryStore>(store: Arc<S>) {
    let key = fresh_key("DELETE");
    let dispatcher = CommandDispatcher::new(store.clone(), Capabilities::default());
    let compactor = Compactor::new(store.clone(), RollupMode::Consolidate);
    dispatcher
        .create_or_update(&InventorySnapshot::new(key.clone(), 5, 0))
        .await
        .unwrap();
    dispatcher.adjust(&key, 1).await.unwrap();
    dispatcher.adjust(&key, 2).await.unwrap();

    let plan = compactor.prepare(&key).await.unwrap();
    dispatcher.delete(&key).await.unwrap();

    assert_eq!(compactor.commit(plan).await.unwrap(), RollupOutcome::Conflict);
    assert!(store.live_journal_ids(&key).await.unwrap().is_empty());
    assert_eq!(lock_version(&*store, &key).await, None);
}

async fn grouped_reads_pair_bases_with_sums<S: InventoryStore>(store: &S) {
    let warehouse_id = fresh_warehouse();
    let tag = Uuid::new_v4();
    let draining = InventoryKey::new(format!("DRAIN-{}", tag), warehouse_id);
    let short = InventoryKey::new(format!("SHORT-{}", tag), warehouse_id);
    let plenty = InventoryKey::new(format!("PLENTY-{}", tag), warehouse_id);

    store.put_base(&base_row(&draining, 10, 5)).await.unwrap();
    store.put_base(&base_row(&short, 3, 5)).await.unwrap();
    store.put_base(&base_row(&plenty, 20, 5)).await.unwrap();
    store.append_journal(&NewJournalEntry::new(&draining, 0, -6)).await.unwrap();
    store.append_journal(&NewJournalEntry::new(&draining, 1, 0)).await.unwrap();
    store.append_journal(&NewJournalEntry::new(&plenty, 0, 1)).await.unwrap();

    let mut rows = store
        .inventories_with_rollups_in_warehouse(
            &[draining.sku_code.clone(), short.sku_code.clone(), format!("MISSING-{}", tag)],
            warehouse_id,
        )
        .await
        .unwrap();
    rows.sort_by(|a, b| a.0.sku_code.cmp(&b.0.sku_code));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0.key(), draining);
    assert_eq!(rows[0].1, RollupResult::new(1, -6));
    assert_eq!(rows[1].0.key(), short);
    assert_eq!(rows[1].1, RollupResult::default());

    let for_sku = store.inventories_with_rollups_for_sku(&draining.sku_code).await.unwrap();
    assert_eq!(for_sku.len(), 1);
    assert_eq!(for_sku[0].1, RollupResult::new(1, -6));

    let journaled: Vec<InventoryKey> = store
        .low_stock_journaled(&[], warehouse_id)
        .await
        .unwrap()
        .into_iter()
        .map(|(base, _)| base.key())
        .collect();
    assert_eq!(journaled, vec![draining.clone()]);

    let base_only: Vec<InventoryKey> = store
        .low_stock_base(&[], warehouse_id)
        .await
        .unwrap()
        .into_iter()
        .map(|(base, _)| base.key())
        .collect();
    assert_eq!(base_only, vec![short.clone()]);

    let candidates = store.keys_needing_rollup(2).await.unwrap();
    assert!(candidates.contains(&draining));
    assert!(!candidates.contains(&plenty));

    let ids = store.live_journal_ids(&draining).await.unwrap();
    assert_eq!(store.sum_journal(&ids).await.unwrap(), Some(RollupResult::new(1, -6)));
}

macro_rules! store_contract {
    ($backend:ident, $make:expr $(, #[$attr:meta])*) => {
        mod $backend {
            use super::*;

            #[tokio::test]
            $(#[$attr])*
            async fn lock_is_created_lazily_and_kept() {
                let store = $make;
                super::lock_is_created_lazily_and_kept(&*store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn lost_cas_rolls_back_whole_unit() {
                let store = $make;
                super::lost_cas_rolls_back_whole_unit(&*store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn merge_into_missing_base_rolls_back() {
                let store = $make;
                super::merge_into_missing_base_rolls_back(&*store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn contended_compaction_has_one_winner() {
                let store = $make;
                super::contended_compaction_has_one_winner(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn merge_mode_updates_base_in_place() {
                let store = $make;
                super::merge_mode_updates_base_in_place(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn delete_defeats_planned_compaction() {
                let store = $make;
                super::delete_defeats_planned_compaction(store).await;
            }

            #[tokio::test]
            $(#[$attr])*
            async fn grouped_reads_pair_bases_with_sums() {
                let store = $make;
                super::grouped_reads_pair_bases_with_sums(&*store).await;
            }
        }
    };
}

async fn pg_store() -> Arc<PgInventoryStore> {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a Postgres database");
    run_migrations(&url).unwrap();
    Arc::new(PgInventoryStore::connect(&url).await.unwrap())
}

store_contract!(memory, Arc::new(InMemoryInventoryStore::new()));
store_contract!(postgres, pg_store().await, #[ignore = "needs DATABASE_URL"]);
