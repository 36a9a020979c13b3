use shared::InventoryKey;
use thiserror::Error;

/// Failures at the storage boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A compare-and-swap in a unit of work lost the race; nothing was applied.
    #[error("optimistic lock conflict on {0}")]
    Conflict(InventoryKey),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("quantity overflow: {0}")]
    Overflow(String),
    #[error("corrupt store state: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced to callers of the dispatcher and read model.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl InventoryError {
    pub fn is_validation(&self) -> bool {
        matches!(self, InventoryError::InvalidArgument(_))
    }
}
