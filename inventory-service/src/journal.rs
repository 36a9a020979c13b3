use std::sync::Arc;

use shared::InventoryKey;
use tracing::debug;

use crate::error::StoreResult;
use crate::models::NewJournalEntry;
use crate::store::InventoryStore;

/// Appends delta rows for validated mutations.
pub struct JournalWriter<S> {
    store: Arc<S>,
}

impl<S: InventoryStore> JournalWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Appends one delta row and returns its id, or `None` when both deltas
    /// are zero and nothing was written.
    pub async fn write(
        &self,
        key: &InventoryKey,
        allocated_quantity_delta: i32,
        quantity_on_hand_delta: i32,
    ) -> StoreResult<Option<i64>> {
        let entry = NewJournalEntry::new(key, allocated_quantity_delta, quantity_on_hand_delta);
        if entry.is_noop() {
            debug!(sku = %key.sku_code, warehouse_id = key.warehouse_id, "skipping no-op journal entry");
            return Ok(None);
        }
        let id = self.store.append_journal(&entry).await?;
        debug!(
            sku = %key.sku_code,
            warehouse_id = key.warehouse_id,
            journal_id = id,
            allocated_quantity_delta,
            quantity_on_hand_delta,
            "journal entry appended"
        );
        Ok(Some(id))
    }
}

impl<S> Clone for JournalWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}
