use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use shared::{InventoryKey, InventorySnapshot};

use crate::error::{StoreError, StoreResult};

/// Base snapshot row. Only create-or-update and the rollup touch it.
#[derive(Debug, Clone, PartialEq, Queryable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory)]
#[diesel(primary_key(sku_code, warehouse_id))]
#[diesel(treat_none_as_null = true)]
pub struct Inventory {
    pub sku_code: String,
    pub warehouse_id: i64,
    pub quantity_on_hand: i32,
    pub allocated_quantity: i32,
    pub reserved_quantity: i32,
    pub reorder_minimum: i32,
    pub reorder_quantity: i32,
    pub restock_date: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory_journal)]
pub struct JournalEntry {
    pub id: i64,
    pub sku_code: String,
    pub warehouse_id: i64,
    pub allocated_quantity_delta: i32,
    pub quantity_on_hand_delta: i32,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Insertable)]
#[diesel(table_name = crate::schema::inventory_journal)]
pub struct NewJournalEntry {
    pub sku_code: String,
    pub warehouse_id: i64,
    pub allocated_quantity_delta: i32,
    pub quantity_on_hand_delta: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Queryable, Insertable)]
#[diesel(table_name = crate::schema::inventory_journal_lock)]
pub struct JournalLock {
    pub sku_code: String,
    pub warehouse_id: i64,
    pub lock_count: i64,
}

/// Summed deltas of a set of journal rows. Never stored on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupResult {
    pub allocated_quantity_delta: i32,
    pub quantity_on_hand_delta: i32,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::processed_commands)]
pub struct ProcessedCommand {
    pub idempotency_key: String,
    pub command_id: Uuid,
    pub result: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Inventory {
    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.sku_code.clone(), self.warehouse_id)
    }
}

impl From<&InventorySnapshot> for Inventory {
    fn from(snapshot: &InventorySnapshot) -> Self {
        Self {
            sku_code: snapshot.key.sku_code.clone(),
            warehouse_id: snapshot.key.warehouse_id,
            quantity_on_hand: snapshot.quantity_on_hand,
            allocated_quantity: snapshot.allocated_quantity,
            reserved_quantity: snapshot.reserved_quantity,
            reorder_minimum: snapshot.reorder_minimum,
            reorder_quantity: snapshot.reorder_quantity,
            restock_date: snapshot.restock_date,
            updated_at: Some(Utc::now()),
        }
    }
}

impl JournalEntry {
    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.sku_code.clone(), self.warehouse_id)
    }

    pub fn deltas(&self) -> RollupResult {
        RollupResult {
            allocated_quantity_delta: self.allocated_quantity_delta,
            quantity_on_hand_delta: self.quantity_on_hand_delta,
        }
    }
}

impl NewJournalEntry {
    pub fn new(key: &InventoryKey, allocated_quantity_delta: i32, quantity_on_hand_delta: i32) -> Self {
        Self {
            sku_code: key.sku_code.clone(),
            warehouse_id: key.warehouse_id,
            allocated_quantity_delta,
            quantity_on_hand_delta,
        }
    }

    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.sku_code.clone(), self.warehouse_id)
    }

    pub fn is_noop(&self) -> bool {
        self.allocated_quantity_delta == 0 && self.quantity_on_hand_delta == 0
    }
}

impl JournalLock {
    pub fn new(key: &InventoryKey) -> Self {
        Self {
            sku_code: key.sku_code.clone(),
            warehouse_id: key.warehouse_id,
            lock_count: 0,
        }
    }
}

impl RollupResult {
    pub fn new(allocated_quantity_delta: i32, quantity_on_hand_delta: i32) -> Self {
        Self {
            allocated_quantity_delta,
            quantity_on_hand_delta,
        }
    }

    /// Builds a rollup from SQL `SUM` outputs, which widen to BIGINT.
    pub fn from_sums(allocated: Option<i64>, on_hand: Option<i64>) -> StoreResult<Self> {
        Ok(Self {
            allocated_quantity_delta: narrow(allocated.unwrap_or(0), "allocated quantity delta")?,
            quantity_on_hand_delta: narrow(on_hand.unwrap_or(0), "quantity on hand delta")?,
        })
    }

    pub fn is_trivial(&self) -> bool {
        self.allocated_quantity_delta == 0 && self.quantity_on_hand_delta == 0
    }

    pub fn checked_add(&self, other: &RollupResult) -> StoreResult<Self> {
        let allocated = self
            .allocated_quantity_delta
            .checked_add(other.allocated_quantity_delta)
            .ok_or_else(|| StoreError::Overflow("allocated quantity delta".to_string()))?;
        let on_hand = self
            .quantity_on_hand_delta
            .checked_add(other.quantity_on_hand_delta)
            .ok_or_else(|| StoreError::Overflow("quantity on hand delta".to_string()))?;
        Ok(Self::new(allocated, on_hand))
    }
}

fn narrow(value: i64, what: &str) -> StoreResult<i32> {
    i32::try_from(value).map_err(|_| StoreError::Overflow(format!("{} sum {} exceeds i32", what, value)))
}
