//! Storage boundary for the inventory journal.
//!
//! Commands only ever append journal rows or upsert base rows; the rollup is
//! the only writer that deletes journal rows, and it does so through a
//! [`UnitOfWork`] that a backend must apply all-or-nothing.

mod memory;
mod postgres;

pub use memory::InMemoryInventoryStore;
pub use postgres::{run_migrations, DbPool, PgInventoryStore, MIGRATIONS};

use async_trait::async_trait;
use shared::InventoryKey;

use crate::error::StoreResult;
use crate::models::{Inventory, JournalLock, NewJournalEntry, ProcessedCommand, RollupResult};

/// A base row paired with the sum of its live journal rows, read together.
pub type RolledUpInventory = (Inventory, RollupResult);

/// One write inside a compaction unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    AppendJournal(NewJournalEntry),
    DeleteJournal(Vec<i64>),
    /// Fails the whole unit when the stored version is not `expected`.
    CasLock {
        key: InventoryKey,
        expected: i64,
        new: i64,
    },
    /// Adds the deltas to an existing base row; a missing row fails the unit.
    MergeIntoBase {
        key: InventoryKey,
        rollup: RollupResult,
    },
    /// Removes the lock row if present. A compactor holding the old version
    /// then fails its CAS.
    DeleteLock(InventoryKey),
    DeleteJournalByKey(InventoryKey),
}

/// Ordered writes applied atomically by [`InventoryStore::commit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOfWork {
    ops: Vec<WriteOp>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_journal(&mut self, entry: NewJournalEntry) -> &mut Self {
        self.ops.push(WriteOp::AppendJournal(entry));
        self
    }

    pub fn delete_journal(&mut self, ids: Vec<i64>) -> &mut Self {
        self.ops.push(WriteOp::DeleteJournal(ids));
        self
    }

    pub fn cas_lock(&mut self, key: InventoryKey, expected: i64, new: i64) -> &mut Self {
        self.ops.push(WriteOp::CasLock { key, expected, new });
        self
    }

    pub fn merge_into_base(&mut self, key: InventoryKey, rollup: RollupResult) -> &mut Self {
        self.ops.push(WriteOp::MergeIntoBase { key, rollup });
        self
    }

    pub fn delete_lock(&mut self, key: InventoryKey) -> &mut Self {
        self.ops.push(WriteOp::DeleteLock(key));
        self
    }

    pub fn delete_journal_by_key(&mut self, key: InventoryKey) -> &mut Self {
        self.ops.push(WriteOp::DeleteJournalByKey(key));
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    // -- base snapshot --

    async fn get_base(&self, key: &InventoryKey) -> StoreResult<Option<Inventory>>;

    /// Inserts or replaces the base row for `inventory.key()`.
    async fn put_base(&self, inventory: &Inventory) -> StoreResult<()>;

    /// Returns `true` if a row was removed.
    async fn delete_base(&self, key: &InventoryKey) -> StoreResult<bool>;

    // -- journal --

    /// Appends one journal row and returns its id.
    async fn append_journal(&self, entry: &NewJournalEntry) -> StoreResult<i64>;

    /// Ids of every journal row currently present for `key`, ascending.
    async fn live_journal_ids(&self, key: &InventoryKey) -> StoreResult<Vec<i64>>;

    /// Sum of exactly the given rows. `None` when none of them exist.
    async fn sum_journal(&self, ids: &[i64]) -> StoreResult<Option<RollupResult>>;

    async fn delete_journal(&self, ids: &[i64]) -> StoreResult<u64>;

    async fn delete_journal_by_key(&self, key: &InventoryKey) -> StoreResult<u64>;

    /// Keys with at least `min_rows` live journal rows.
    async fn keys_needing_rollup(&self, min_rows: usize) -> StoreResult<Vec<InventoryKey>>;

    // -- journal lock --

    async fn get_lock(&self, key: &InventoryKey) -> StoreResult<Option<JournalLock>>;

    /// Inserts the lock row at version 0 unless it already exists, then
    /// returns the stored row.
    async fn create_lock(&self, key: &InventoryKey) -> StoreResult<JournalLock>;

    /// Single compare-and-swap outside a unit of work. `false` on mismatch.
    async fn cas_lock(&self, key: &InventoryKey, expected: i64, new: i64) -> StoreResult<bool>;

    async fn delete_lock(&self, key: &InventoryKey) -> StoreResult<bool>;

    // -- atomic compaction writes --

    /// Applies every op or none. A lost CAS or a merge into a missing base
    /// row yields [`StoreError::Conflict`](crate::error::StoreError::Conflict).
    async fn commit(&self, work: UnitOfWork) -> StoreResult<()>;

    // -- consistent reads --

    async fn inventory_with_rollup(&self, key: &InventoryKey) -> StoreResult<Option<RolledUpInventory>>;

    async fn inventories_with_rollups_in_warehouse(
        &self,
        sku_codes: &[String],
        warehouse_id: i64,
    ) -> StoreResult<Vec<RolledUpInventory>>;

    async fn inventories_with_rollups_for_sku(&self, sku_code: &str) -> StoreResult<Vec<RolledUpInventory>>;

    /// Low-stock rows judged on base values alone. An empty SKU list means
    /// every SKU in the warehouse.
    async fn low_stock_base(&self, sku_codes: &[String], warehouse_id: i64) -> StoreResult<Vec<RolledUpInventory>>;

    /// Low-stock rows judged on base plus journal, restricted to keys that
    /// have journal rows.
    async fn low_stock_journaled(
        &self,
        sku_codes: &[String],
        warehouse_id: i64,
    ) -> StoreResult<Vec<RolledUpInventory>>;

    // -- command idempotency --

    async fn processed_command(&self, idempotency_key: &str) -> StoreResult<Option<ProcessedCommand>>;

    async fn record_processed_command(&self, record: &ProcessedCommand) -> StoreResult<()>;
}

/// Shared low-stock rule for both backends.
pub(crate) fn is_low_stock(inventory: &Inventory, rollup: &RollupResult) -> bool {
    let on_hand = i64::from(inventory.quantity_on_hand) + i64::from(rollup.quantity_on_hand_delta);
    let allocated = i64::from(inventory.allocated_quantity) + i64::from(rollup.allocated_quantity_delta);
    on_hand - allocated.max(0) <= i64::from(inventory.reorder_minimum)
}
