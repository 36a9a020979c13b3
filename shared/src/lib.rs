use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;

/// Composite identity of a tracked stock position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InventoryKey {
    pub sku_code: String,
    pub warehouse_id: i64,
}

/// Full base-row payload for the create-or-update command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub key: InventoryKey,
    pub quantity_on_hand: i32,
    pub allocated_quantity: i32,
    #[serde(default)]
    pub reserved_quantity: i32,
    #[serde(default)]
    pub reorder_minimum: i32,
    #[serde(default)]
    pub reorder_quantity: i32,
    #[serde(default)]
    pub restock_date: Option<DateTime<Utc>>,
}

/// Computed read model: base snapshot plus the live journal sum.
///
/// `allocated_quantity` is never negative here even though the journal may
/// drive it below zero internally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryView {
    pub key: InventoryKey,
    pub quantity_on_hand: i32,
    pub allocated_quantity: i32,
    pub reserved_quantity: i32,
    pub reorder_minimum: i32,
    pub reorder_quantity: i32,
    pub restock_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InventoryCommand {
    Adjust { key: InventoryKey, quantity: i32 },
    Allocate { key: InventoryKey, quantity: i32 },
    Deallocate { key: InventoryKey, quantity: i32 },
    Release { key: InventoryKey, quantity: i32 },
    CreateOrUpdate { snapshot: InventorySnapshot },
    Delete { key: InventoryKey },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: Uuid,
    pub command: InventoryCommand,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: Uuid,
    pub command_id: Uuid,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
}

impl InventoryKey {
    pub fn new(sku_code: impl Into<String>, warehouse_id: i64) -> Self {
        Self {
            sku_code: sku_code.into(),
            warehouse_id,
        }
    }
}

impl fmt::Display for InventoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sku_code, self.warehouse_id)
    }
}

impl InventorySnapshot {
    pub fn new(key: InventoryKey, quantity_on_hand: i32, allocated_quantity: i32) -> Self {
        Self {
            key,
            quantity_on_hand,
            allocated_quantity,
            reserved_quantity: 0,
            reorder_minimum: 0,
            reorder_quantity: 0,
            restock_date: None,
        }
    }
}

impl InventoryView {
    /// On-hand minus allocated. Negative when oversold.
    pub fn available_quantity_in_stock(&self) -> i32 {
        self.quantity_on_hand.saturating_sub(self.allocated_quantity)
    }
}

impl InventoryCommand {
    pub fn key(&self) -> &InventoryKey {
        match self {
            InventoryCommand::Adjust { key, .. }
            | InventoryCommand::Allocate { key, .. }
            | InventoryCommand::Deallocate { key, .. }
            | InventoryCommand::Release { key, .. }
            | InventoryCommand::Delete { key } => key,
            InventoryCommand::CreateOrUpdate { snapshot } => &snapshot.key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InventoryCommand::Adjust { .. } => "adjust",
            InventoryCommand::Allocate { .. } => "allocate",
            InventoryCommand::Deallocate { .. } => "deallocate",
            InventoryCommand::Release { .. } => "release",
            InventoryCommand::CreateOrUpdate { .. } => "create_or_update",
            InventoryCommand::Delete { .. } => "delete",
        }
    }
}

impl CommandEnvelope {
    pub fn new(command: InventoryCommand) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            idempotency_key: format!("{}_{}", command.name(), id),
            command,
            created_at: Utc::now(),
        }
    }
}

impl CommandReply {
    pub fn success(command_id: Uuid, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            status: CommandStatus::Success,
            result,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(command_id: Uuid, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id,
            status: CommandStatus::Failed,
            result: None,
            error: Some(error),
            created_at: Utc::now(),
        }
    }
}
