use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use shared::InventoryKey;
use tokio::sync::RwLock;

use super::{is_low_stock, InventoryStore, RolledUpInventory, UnitOfWork, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::models::{Inventory, JournalEntry, JournalLock, NewJournalEntry, ProcessedCommand, RollupResult};

/// In-memory store for tests, local runs and embedding.
///
/// All state sits behind one lock, so every call (and every committed unit of
/// work) is observed atomically.
#[derive(Default)]
pub struct InMemoryInventoryStore {
    inner: RwLock<StoreState>,
}

#[derive(Default)]
struct StoreState {
    bases: HashMap<InventoryKey, Inventory>,
    journal: BTreeMap<i64, JournalEntry>,
    next_journal_id: i64,
    locks: HashMap<InventoryKey, i64>,
    processed: HashMap<String, ProcessedCommand>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every live journal row for `key`, oldest first.
    pub async fn journal_entries(&self, key: &InventoryKey) -> Vec<JournalEntry> {
        let state = self.inner.read().await;
        state
            .journal
            .values()
            .filter(|entry| entry.sku_code == key.sku_code && entry.warehouse_id == key.warehouse_id)
            .cloned()
            .collect()
    }

    pub async fn journal_len(&self) -> usize {
        self.inner.read().await.journal.len()
    }
}

impl StoreState {
    fn append(&mut self, entry: &NewJournalEntry) -> i64 {
        self.next_journal_id += 1;
        let id = self.next_journal_id;
        self.journal.insert(
            id,
            JournalEntry {
                id,
                sku_code: entry.sku_code.clone(),
                warehouse_id: entry.warehouse_id,
                allocated_quantity_delta: entry.allocated_quantity_delta,
                quantity_on_hand_delta: entry.quantity_on_hand_delta,
                created_at: Some(Utc::now()),
            },
        );
        id
    }

    fn rollup_for(&self, key: &InventoryKey) -> StoreResult<RollupResult> {
        let mut allocated = 0i64;
        let mut on_hand = 0i64;
        for entry in self.journal.values().filter(|e| matches_key(e, key)) {
            allocated += i64::from(entry.allocated_quantity_delta);
            on_hand += i64::from(entry.quantity_on_hand_delta);
        }
        RollupResult::from_sums(Some(allocated), Some(on_hand))
    }

    fn has_journal(&self, key: &InventoryKey) -> bool {
        self.journal.values().any(|e| matches_key(e, key))
    }

    fn bases_in_warehouse<'a>(
        &'a self,
        sku_codes: &'a [String],
        warehouse_id: i64,
    ) -> impl Iterator<Item = &'a Inventory> + 'a {
        self.bases.values().filter(move |inv| {
            inv.warehouse_id == warehouse_id && (sku_codes.is_empty() || sku_codes.contains(&inv.sku_code))
        })
    }

    /// Checks every precondition before anything is mutated.
    fn validate(&self, ops: &[WriteOp]) -> StoreResult<()> {
        for op in ops {
            match op {
                WriteOp::CasLock { key, expected, .. } => {
                    if self.locks.get(key) != Some(expected) {
                        return Err(StoreError::Conflict(key.clone()));
                    }
                }
                WriteOp::MergeIntoBase { key, rollup } => {
                    let base = self.bases.get(key).ok_or_else(|| StoreError::Conflict(key.clone()))?;
                    base.quantity_on_hand
                        .checked_add(rollup.quantity_on_hand_delta)
                        .zip(base.allocated_quantity.checked_add(rollup.allocated_quantity_delta))
                        .ok_or_else(|| StoreError::Overflow(format!("merging rollup into {}", key)))?;
                }
                WriteOp::AppendJournal(_)
                | WriteOp::DeleteJournal(_)
                | WriteOp::DeleteLock(_)
                | WriteOp::DeleteJournalByKey(_) => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::AppendJournal(entry) => {
                self.append(&entry);
            }
            WriteOp::DeleteJournal(ids) => {
                for id in ids {
                    self.journal.remove(&id);
                }
            }
            WriteOp::CasLock { key, new, .. } => {
                self.locks.insert(key, new);
            }
            WriteOp::MergeIntoBase { key, rollup } => {
                if let Some(base) = self.bases.get_mut(&key) {
                    base.quantity_on_hand += rollup.quantity_on_hand_delta;
                    base.allocated_quantity += rollup.allocated_quantity_delta;
                    base.updated_at = Some(Utc::now());
                }
            }
            WriteOp::DeleteLock(key) => {
                self.locks.remove(&key);
            }
            WriteOp::DeleteJournalByKey(key) => {
                self.journal.retain(|_, e| !matches_key(e, &key));
            }
        }
    }
}

fn matches_key(entry: &JournalEntry, key: &InventoryKey) -> bool {
    entry.sku_code == key.sku_code && entry.warehouse_id == key.warehouse_id
}

#[async_trait]
impl InventoryStore for InMemoryInventoryStore {
    async fn get_base(&self, key: &InventoryKey) -> StoreResult<Option<Inventory>> {
        Ok(self.inner.read().await.bases.get(key).cloned())
    }

    async fn put_base(&self, inventory: &Inventory) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .bases
            .insert(inventory.key(), inventory.clone());
        Ok(())
    }

    async fn delete_base(&self, key: &InventoryKey) -> StoreResult<bool> {
        Ok(self.inner.write().await.bases.remove(key).is_some())
    }

    async fn append_journal(&self, entry: &NewJournalEntry) -> StoreResult<i64> {
        Ok(self.inner.write().await.append(entry))
    }

    async fn live_journal_ids(&self, key: &InventoryKey) -> StoreResult<Vec<i64>> {
        let state = self.inner.read().await;
        Ok(state
            .journal
            .values()
            .filter(|e| matches_key(e, key))
            .map(|e| e.id)
            .collect())
    }

    async fn sum_journal(&self, ids: &[i64]) -> StoreResult<Option<RollupResult>> {
        let state = self.inner.read().await;
        let mut found = false;
        let mut allocated = 0i64;
        let mut on_hand = 0i64;
        for entry in ids.iter().filter_map(|id| state.journal.get(id)) {
            found = true;
            allocated += i64::from(entry.allocated_quantity_delta);
            on_hand += i64::from(entry.quantity_on_hand_delta);
        }
        if !found {
            return Ok(None);
        }
        RollupResult::from_sums(Some(allocated), Some(on_hand)).map(Some)
    }

    async fn delete_journal(&self, ids: &[i64]) -> StoreResult<u64> {
        let mut state = self.inner.write().await;
        let mut removed = 0u64;
        for id in ids {
            if state.journal.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_journal_by_key(&self, key: &InventoryKey) -> StoreResult<u64> {
        let mut state = self.inner.write().await;
        let before = state.journal.len();
        state.journal.retain(|_, e| !matches_key(e, key));
        Ok((before - state.journal.len()) as u64)
    }

    async fn keys_needing_rollup(&self, min_rows: usize) -> StoreResult<Vec<InventoryKey>> {
        let state = self.inner.read().await;
        let mut counts: BTreeMap<InventoryKey, usize> = BTreeMap::new();
        for entry in state.journal.values() {
            *counts.entry(entry.key()).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .filter(|(_, count)| *count >= min_rows)
            .map(|(key, _)| key)
            .collect())
    }

    async fn get_lock(&self, key: &InventoryKey) -> StoreResult<Option<JournalLock>> {
        let state = self.inner.read().await;
        Ok(state.locks.get(key).map(|lock_count| JournalLock {
            sku_code: key.sku_code.clone(),
            warehouse_id: key.warehouse_id,
            lock_count: *lock_count,
        }))
    }

    async fn create_lock(&self, key: &InventoryKey) -> StoreResult<JournalLock> {
        let mut state = self.inner.write().await;
        let lock_count = *state.locks.entry(key.clone()).or_insert(0);
        Ok(JournalLock {
            sku_code: key.sku_code.clone(),
            warehouse_id: key.warehouse_id,
            lock_count,
        })
    }

    async fn cas_lock(&self, key: &InventoryKey, expected: i64, new: i64) -> StoreResult<bool> {
        let mut state = self.inner.write().await;
        match state.locks.get_mut(key) {
            Some(current) if *current == expected => {
                *current = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_lock(&self, key: &InventoryKey) -> StoreResult<bool> {
        Ok(self.inner.write().await.locks.remove(key).is_some())
    }

    async fn commit(&self, work: UnitOfWork) -> StoreResult<()> {
        let mut state = self.inner.write().await;
        state.validate(work.ops())?;
        for op in work.into_ops() {
            state.apply(op);
        }
        Ok(())
    }

    async fn inventory_with_rollup(&self, key: &InventoryKey) -> StoreResult<Option<RolledUpInventory>> {
        let state = self.inner.read().await;
        match state.bases.get(key) {
            Some(base) => Ok(Some((base.clone(), state.rollup_for(key)?))),
            None => Ok(None),
        }
    }

    async fn inventories_with_rollups_in_warehouse(
        &self,
        sku_codes: &[String],
        warehouse_id: i64,
    ) -> StoreResult<Vec<RolledUpInventory>> {
        if sku_codes.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.inner.read().await;
        state
            .bases_in_warehouse(sku_codes, warehouse_id)
            .map(|base| Ok((base.clone(), state.rollup_for(&base.key())?)))
            .collect()
    }

    async fn inventories_with_rollups_for_sku(&self, sku_code: &str) -> StoreResult<Vec<RolledUpInventory>> {
        let state = self.inner.read().await;
        state
            .bases
            .values()
            .filter(|base| base.sku_code == sku_code)
            .map(|base| Ok((base.clone(), state.rollup_for(&base.key())?)))
            .collect()
    }

    async fn low_stock_base(&self, sku_codes: &[String], warehouse_id: i64) -> StoreResult<Vec<RolledUpInventory>> {
        let state = self.inner.read().await;
        let none = RollupResult::default();
        Ok(state
            .bases_in_warehouse(sku_codes, warehouse_id)
            .filter(|base| is_low_stock(base, &none))
            .map(|base| (base.clone(), none))
            .collect())
    }

    async fn low_stock_journaled(
        &self,
        sku_codes: &[String],
        warehouse_id: i64,
    ) -> StoreResult<Vec<RolledUpInventory>> {
        let state = self.inner.read().await;
        let mut rows = Vec::new();
        for base in state.bases_in_warehouse(sku_codes, warehouse_id) {
            let key = base.key();
            if !state.has_journal(&key) {
                continue;
            }
            let rollup = state.rollup_for(&key)?;
            if is_low_stock(base, &rollup) {
                rows.push((base.clone(), rollup));
            }
        }
        Ok(rows)
    }

    async fn processed_command(&self, idempotency_key: &str) -> StoreResult<Option<ProcessedCommand>> {
        Ok(self.inner.read().await.processed.get(idempotency_key).cloned())
    }

    async fn record_processed_command(&self, record: &ProcessedCommand) -> StoreResult<()> {
        self.inner
            .write()
            .await
            .processed
            .insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> InventoryKey {
        InventoryKey::new("SKU-1", 10)
    }

    #[tokio::test]
    async fn sum_of_unknown_ids_is_none() {
        let store = InMemoryInventoryStore::new();
        assert_eq!(store.sum_journal(&[41, 42]).await.unwrap(), None);

        let id = store.append_journal(&NewJournalEntry::new(&key(), 2, 3)).await.unwrap();
        let sum = store.sum_journal(&[id, 999]).await.unwrap();
        assert_eq!(sum, Some(RollupResult::new(2, 3)));
    }

    #[tokio::test]
    async fn failed_cas_leaves_unit_unapplied() {
        let store = InMemoryInventoryStore::new();
        let id = store.append_journal(&NewJournalEntry::new(&key(), 1, 1)).await.unwrap();
        store.create_lock(&key()).await.unwrap();

        let mut work = UnitOfWork::new();
        work.append_journal(NewJournalEntry::new(&key(), 1, 1))
            .delete_journal(vec![id])
            .cas_lock(key(), 7, 8);

        let err = store.commit(work).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.live_journal_ids(&key()).await.unwrap(), vec![id]);
        assert_eq!(store.get_lock(&key()).await.unwrap().unwrap().lock_count, 0);
    }

    #[tokio::test]
    async fn merge_into_missing_base_conflicts() {
        let store = InMemoryInventoryStore::new();
        let mut work = UnitOfWork::new();
        work.merge_into_base(key(), RollupResult::new(1, 1));
        assert!(store.commit(work).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn create_lock_keeps_existing_version() {
        let store = InMemoryInventoryStore::new();
        assert_eq!(store.create_lock(&key()).await.unwrap().lock_count, 0);
        assert!(store.cas_lock(&key(), 0, 1).await.unwrap());
        assert!(!store.cas_lock(&key(), 0, 1).await.unwrap());
        assert_eq!(store.create_lock(&key()).await.unwrap().lock_count, 1);
    }

    #[tokio::test]
    async fn keys_needing_rollup_respects_threshold() {
        let store = InMemoryInventoryStore::new();
        let other = InventoryKey::new("SKU-2", 10);
        store.append_journal(&NewJournalEntry::new(&key(), 1, 0)).await.unwrap();
        store.append_journal(&NewJournalEntry::new(&key(), 0, 1)).await.unwrap();
        store.append_journal(&NewJournalEntry::new(&other, 0, 1)).await.unwrap();

        assert_eq!(store.keys_needing_rollup(2).await.unwrap(), vec![key()]);
        assert_eq!(store.keys_needing_rollup(1).await.unwrap().len(), 2);
    }
}
