//! Journaled inventory: commands append signed deltas per (SKU, warehouse),
//! reads add the live deltas to a base row, and a rollup job periodically
//! compacts the journal under an optimistic per-key lock.

pub mod availability;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod journal;
pub mod models;
pub mod reads;
pub mod rollup;
pub mod schema;
pub mod store;

pub use availability::{AlwaysAvailableSkus, SkuAvailability};
pub use config::{Capabilities, FailurePolicy, InventoryConfig, RollupConfig, RollupMode};
pub use dispatcher::{CommandDispatcher, ExecutionResult};
pub use error::{InventoryError, StoreError};
pub use reads::ReadModel;
pub use rollup::{Compactor, RollupOutcome, RollupProcessor, RollupReport};
pub use store::{InMemoryInventoryStore, InventoryStore, PgInventoryStore};
