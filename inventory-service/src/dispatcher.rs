//! The closed set of inventory mutations.
//!
//! Quantity changes only ever append journal rows; create-or-update writes
//! the base row directly. No command touches the journal lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shared::{InventoryCommand, InventoryKey, InventorySnapshot};
use tracing::{info, warn};

use crate::config::Capabilities;
use crate::error::InventoryError;
use crate::journal::JournalWriter;
use crate::models::Inventory;
use crate::store::{InventoryStore, UnitOfWork};

/// Outcome of a successful command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The quantity the command moved. Zero for create-or-update and delete.
    pub quantity: i32,
}

pub struct CommandDispatcher<S> {
    store: Arc<S>,
    journal: JournalWriter<S>,
    capabilities: Capabilities,
}

impl<S: InventoryStore> CommandDispatcher<S> {
    pub fn new(store: Arc<S>, capabilities: Capabilities) -> Self {
        Self {
            journal: JournalWriter::new(Arc::clone(&store)),
            store,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub async fn execute(&self, command: InventoryCommand) -> Result<ExecutionResult, InventoryError> {
        match command {
            InventoryCommand::Adjust { key, quantity } => self.adjust(&key, quantity).await,
            InventoryCommand::Allocate { key, quantity } => self.allocate(&key, quantity).await,
            InventoryCommand::Deallocate { key, quantity } => self.deallocate(&key, quantity).await,
            InventoryCommand::Release { key, quantity } => self.release(&key, quantity).await,
            InventoryCommand::CreateOrUpdate { snapshot } => self.create_or_update(&snapshot).await,
            InventoryCommand::Delete { key } => self.delete(&key).await,
        }
    }

    /// Signed change to on-hand stock.
    pub async fn adjust(&self, key: &InventoryKey, delta: i32) -> Result<ExecutionResult, InventoryError> {
        self.journal.write(key, 0, delta).await?;
        Ok(ExecutionResult { quantity: delta })
    }

    pub async fn allocate(&self, key: &InventoryKey, quantity: i32) -> Result<ExecutionResult, InventoryError> {
        if quantity < 0 {
            return Err(invalid("allocate", key, quantity, "must not be negative"));
        }
        self.journal.write(key, quantity, 0).await?;
        Ok(ExecutionResult { quantity })
    }

    pub async fn deallocate(&self, key: &InventoryKey, quantity: i32) -> Result<ExecutionResult, InventoryError> {
        if quantity < 0 {
            return Err(invalid("deallocate", key, quantity, "must not be negative"));
        }
        self.journal.write(key, -quantity, 0).await?;
        Ok(ExecutionResult { quantity })
    }

    /// Ships allocated stock: both on-hand and allocated drop by `quantity`.
    pub async fn release(&self, key: &InventoryKey, quantity: i32) -> Result<ExecutionResult, InventoryError> {
        if quantity <= 0 {
            return Err(invalid("release", key, quantity, "must be positive"));
        }
        self.journal.write(key, -quantity, -quantity).await?;
        Ok(ExecutionResult { quantity })
    }

    pub async fn create_or_update(&self, snapshot: &InventorySnapshot) -> Result<ExecutionResult, InventoryError> {
        self.store.put_base(&Inventory::from(snapshot)).await?;
        info!(
            sku = %snapshot.key.sku_code,
            warehouse_id = snapshot.key.warehouse_id,
            quantity_on_hand = snapshot.quantity_on_hand,
            allocated_quantity = snapshot.allocated_quantity,
            "inventory base row written"
        );
        Ok(ExecutionResult { quantity: 0 })
    }

    /// Removes the base row. Lock and journal cleanup is best effort; a
    /// failure there is logged and does not fail the command.
    ///
    /// The lock goes first in the same unit as the journal rows, so a
    /// compaction planned before the delete loses its CAS instead of
    /// re-inserting a consolidated row for the deleted key.
    pub async fn delete(&self, key: &InventoryKey) -> Result<ExecutionResult, InventoryError> {
        let removed = self.store.delete_base(key).await?;

        let mut cleanup = UnitOfWork::new();
        cleanup.delete_lock(key.clone()).delete_journal_by_key(key.clone());
        if let Err(e) = self.store.commit(cleanup).await {
            warn!(%key, error = %e, "failed to remove journal rows and lock");
        }

        info!(%key, removed, "inventory deleted");
        Ok(ExecutionResult { quantity: 0 })
    }
}

fn invalid(operation: &str, key: &InventoryKey, quantity: i32, reason: &str) -> InventoryError {
    InventoryError::InvalidArgument(format!(
        "{} quantity {} for {} {}",
        operation, quantity, key, reason
    ))
}
