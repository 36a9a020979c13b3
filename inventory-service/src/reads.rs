//! Read side: base rows plus live journal sums, assembled into views.
//!
//! Nothing here writes. Always-available SKUs are filtered out of every
//! answer, and the allocated quantity is clamped to zero only in
//! [`assemble_view`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use shared::{InventoryKey, InventoryView};

use crate::availability::SkuAvailability;
use crate::error::{InventoryError, StoreError, StoreResult};
use crate::models::{Inventory, RollupResult};
use crate::store::InventoryStore;

pub struct ReadModel<S> {
    store: Arc<S>,
    availability: Arc<dyn SkuAvailability>,
}

/// Base row plus journal sum, with allocated clamped at zero.
pub fn assemble_view(base: &Inventory, rollup: &RollupResult) -> StoreResult<InventoryView> {
    let quantity_on_hand = base
        .quantity_on_hand
        .checked_add(rollup.quantity_on_hand_delta)
        .ok_or_else(|| StoreError::Overflow(format!("quantity on hand of {}", base.key())))?;
    let allocated = base
        .allocated_quantity
        .checked_add(rollup.allocated_quantity_delta)
        .ok_or_else(|| StoreError::Overflow(format!("allocated quantity of {}", base.key())))?;
    Ok(InventoryView {
        key: base.key(),
        quantity_on_hand,
        allocated_quantity: allocated.max(0),
        reserved_quantity: base.reserved_quantity,
        reorder_minimum: base.reorder_minimum,
        reorder_quantity: base.reorder_quantity,
        restock_date: base.restock_date,
    })
}

impl<S: InventoryStore> ReadModel<S> {
    pub fn new(store: Arc<S>, availability: Arc<dyn SkuAvailability>) -> Self {
        Self { store, availability }
    }

    fn is_exempt(&self, sku_code: &str) -> bool {
        self.availability.is_always_available(sku_code)
    }

    pub async fn get(&self, key: &InventoryKey) -> Result<Option<InventoryView>, InventoryError> {
        if self.is_exempt(&key.sku_code) {
            return Ok(None);
        }
        let row = self.store.inventory_with_rollup(key).await?;
        match row {
            Some((base, rollup)) => Ok(Some(assemble_view(&base, &rollup)?)),
            None => Ok(None),
        }
    }

    /// Looks keys up one warehouse at a time. Keys without a base row are
    /// left out of the result.
    pub async fn get_many(
        &self,
        keys: &[InventoryKey],
    ) -> Result<HashMap<InventoryKey, InventoryView>, InventoryError> {
        let mut by_warehouse: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for key in keys.iter().filter(|k| !self.is_exempt(&k.sku_code)) {
            let skus = by_warehouse.entry(key.warehouse_id).or_default();
            if !skus.contains(&key.sku_code) {
                skus.push(key.sku_code.clone());
            }
        }

        let mut views = HashMap::with_capacity(keys.len());
        for (warehouse_id, skus) in by_warehouse {
            let rows = self
                .store
                .inventories_with_rollups_in_warehouse(&skus, warehouse_id)
                .await?;
            for (base, rollup) in rows {
                let view = assemble_view(&base, &rollup)?;
                views.insert(view.key.clone(), view);
            }
        }
        Ok(views)
    }

    /// Every warehouse holding `sku_code`, keyed by warehouse id.
    pub async fn get_all_for_sku(&self, sku_code: &str) -> Result<HashMap<i64, InventoryView>, InventoryError> {
        if self.is_exempt(sku_code) {
            return Ok(HashMap::new());
        }
        let rows = self.store.inventories_with_rollups_for_sku(sku_code).await?;
        let mut views = HashMap::with_capacity(rows.len());
        for (base, rollup) in rows {
            views.insert(base.warehouse_id, assemble_view(&base, &rollup)?);
        }
        Ok(views)
    }

    /// The given SKUs in one warehouse, keyed by SKU code.
    pub async fn inventories_for_skus_in_warehouse(
        &self,
        sku_codes: &[String],
        warehouse_id: i64,
    ) -> Result<HashMap<String, InventoryView>, InventoryError> {
        let tracked = self.tracked(sku_codes);
        if tracked.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .store
            .inventories_with_rollups_in_warehouse(&tracked, warehouse_id)
            .await?;
        let mut views = HashMap::with_capacity(rows.len());
        for (base, rollup) in rows {
            let view = assemble_view(&base, &rollup)?;
            views.insert(base.sku_code, view);
        }
        Ok(views)
    }

    /// Rows at or below their reorder minimum. An empty `sku_codes` means
    /// every SKU in the warehouse.
    ///
    /// A key found by both the base-only and the journaled query is reported
    /// once, from the journaled query.
    pub async fn find_low_stock(
        &self,
        sku_codes: &[String],
        warehouse_id: i64,
    ) -> Result<Vec<InventoryView>, InventoryError> {
        let tracked = self.tracked(sku_codes);
        if !sku_codes.is_empty() && tracked.is_empty() {
            return Ok(Vec::new());
        }

        let journaled = self.store.low_stock_journaled(&tracked, warehouse_id).await?;
        let base_only = self.store.low_stock_base(&tracked, warehouse_id).await?;

        let mut merged: BTreeMap<InventoryKey, InventoryView> = BTreeMap::new();
        for (base, rollup) in journaled.iter().chain(base_only.iter()) {
            let key = base.key();
            if !merged.contains_key(&key) {
                merged.insert(key, assemble_view(base, rollup)?);
            }
        }

        Ok(merged
            .into_values()
            .filter(|view| !self.is_exempt(&view.key.sku_code))
            .collect())
    }

    /// Whether `quantity` units can be taken from `key`. Always-available
    /// SKUs always can; unknown keys never can.
    pub async fn has_sufficient_inventory(&self, key: &InventoryKey, quantity: i32) -> Result<bool, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidArgument(format!(
                "requested quantity {} for {} must be positive",
                quantity, key
            )));
        }
        if self.is_exempt(&key.sku_code) {
            return Ok(true);
        }
        Ok(match self.get(key).await? {
            Some(view) => view.available_quantity_in_stock() >= quantity,
            None => false,
        })
    }

    fn tracked(&self, sku_codes: &[String]) -> Vec<String> {
        let mut tracked: Vec<String> = Vec::with_capacity(sku_codes.len());
        for sku in sku_codes.iter().filter(|s| !self.is_exempt(s)) {
            if !tracked.contains(sku) {
                tracked.push(sku.clone());
            }
        }
        tracked
    }
}
