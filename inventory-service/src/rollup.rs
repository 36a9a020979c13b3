//! Journal compaction.
//!
//! A [`Compactor`] folds the live journal rows of one key into a single
//! consolidated row (or into the base row), guarded by a compare-and-swap on
//! the key's journal lock. [`RollupProcessor`] drives it over every key with
//! enough rows, on a timer or once.

use std::sync::Arc;

use shared::InventoryKey;
use tokio::time;
use tracing::{error, info, warn};

use crate::config::{FailurePolicy, RollupConfig, RollupMode};
use crate::error::{StoreError, StoreResult};
use crate::models::{NewJournalEntry, RollupResult};
use crate::store::{InventoryStore, UnitOfWork};

/// Everything read for one compaction attempt, before any write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupPlan {
    pub key: InventoryKey,
    pub lock_version: i64,
    pub journal_ids: Vec<i64>,
    pub sum: Option<RollupResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
    Compacted {
        rows: usize,
        sum: RollupResult,
        version: i64,
    },
    /// No live journal rows; nothing was written.
    Empty,
    /// Another compactor advanced the lock first; nothing was written.
    Conflict,
}

pub struct Compactor<S> {
    store: Arc<S>,
    mode: RollupMode,
}

impl<S: InventoryStore> Compactor<S> {
    pub fn new(store: Arc<S>, mode: RollupMode) -> Self {
        Self { store, mode }
    }

    /// Reads the lock (creating it at version 0 if needed), then snapshots
    /// and sums the key's live journal rows.
    pub async fn prepare(&self, key: &InventoryKey) -> StoreResult<RollupPlan> {
        let lock = match self.store.get_lock(key).await? {
            Some(lock) => lock,
            None => self.store.create_lock(key).await?,
        };
        let journal_ids = self.store.live_journal_ids(key).await?;
        let sum = self.store.sum_journal(&journal_ids).await?;
        Ok(RollupPlan {
            key: key.clone(),
            lock_version: lock.lock_count,
            journal_ids,
            sum,
        })
    }

    /// Writes the plan as one unit: the consolidated row or base merge, the
    /// deletion of exactly the planned rows, and the lock bump.
    pub async fn commit(&self, plan: RollupPlan) -> StoreResult<RollupOutcome> {
        let sum = match plan.sum {
            Some(sum) if !plan.journal_ids.is_empty() => sum,
            _ => return Ok(RollupOutcome::Empty),
        };
        let rows = plan.journal_ids.len();
        let version = plan.lock_version + 1;

        let mut work = UnitOfWork::new();
        let merge = self.mode == RollupMode::MergeIntoBase && self.store.get_base(&plan.key).await?.is_some();
        if merge {
            work.merge_into_base(plan.key.clone(), sum);
        } else {
            work.append_journal(NewJournalEntry::new(
                &plan.key,
                sum.allocated_quantity_delta,
                sum.quantity_on_hand_delta,
            ));
        }
        work.delete_journal(plan.journal_ids)
            .cas_lock(plan.key.clone(), plan.lock_version, version);

        match self.store.commit(work).await {
            Ok(()) => Ok(RollupOutcome::Compacted { rows, sum, version }),
            Err(e) if e.is_conflict() => Ok(RollupOutcome::Conflict),
            Err(e) => Err(e),
        }
    }

    /// One full compaction attempt for `key`, logged.
    pub async fn compact(&self, key: &InventoryKey) -> StoreResult<RollupOutcome> {
        let outcome = match self.prepare(key).await {
            Ok(plan) => self.commit(plan).await,
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(RollupOutcome::Compacted { rows, sum, version }) => info!(
                sku = %key.sku_code,
                warehouse_id = key.warehouse_id,
                allocated_quantity_delta = sum.allocated_quantity_delta,
                quantity_on_hand_delta = sum.quantity_on_hand_delta,
                rows,
                version,
                outcome = "compacted",
                "rollup attempt"
            ),
            Ok(RollupOutcome::Empty) => info!(
                sku = %key.sku_code,
                warehouse_id = key.warehouse_id,
                rows = 0,
                outcome = "empty",
                "rollup attempt"
            ),
            Ok(RollupOutcome::Conflict) => warn!(
                sku = %key.sku_code,
                warehouse_id = key.warehouse_id,
                outcome = "conflict",
                "rollup attempt lost the journal lock, deferring to next pass"
            ),
            Err(e) => warn!(
                sku = %key.sku_code,
                warehouse_id = key.warehouse_id,
                outcome = "failed",
                error = %e,
                "rollup attempt"
            ),
        }
        outcome
    }
}

/// Tally of one batch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupReport {
    pub candidates: usize,
    pub compacted: usize,
    pub empty: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Set when a fail-fast pass stopped before visiting every candidate.
    pub aborted: bool,
}

impl RollupReport {
    pub fn attempted(&self) -> usize {
        self.compacted + self.empty + self.conflicts + self.failed
    }
}

pub struct RollupProcessor<S> {
    store: Arc<S>,
    compactor: Compactor<S>,
    config: RollupConfig,
}

impl<S: InventoryStore> RollupProcessor<S> {
    pub fn new(store: Arc<S>, config: RollupConfig) -> Self {
        Self {
            compactor: Compactor::new(Arc::clone(&store), config.mode),
            store,
            config,
        }
    }

    pub fn compactor(&self) -> &Compactor<S> {
        &self.compactor
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.config.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.run_once().await {
                error!("Error running inventory rollup: {}", e);
            }
        }
    }

    /// Compacts every key with at least `min_rows` live rows, in key order.
    ///
    /// Only listing the candidates can fail the pass; per-key failures are
    /// counted and handled by the configured [`FailurePolicy`].
    pub async fn run_once(&self) -> Result<RollupReport, StoreError> {
        let keys = self.store.keys_needing_rollup(self.config.min_rows).await?;
        let mut report = RollupReport {
            candidates: keys.len(),
            ..RollupReport::default()
        };

        for key in &keys {
            let failed = match self.compactor.compact(key).await {
                Ok(RollupOutcome::Compacted { .. }) => {
                    report.compacted += 1;
                    false
                }
                Ok(RollupOutcome::Empty) => {
                    report.empty += 1;
                    false
                }
                Ok(RollupOutcome::Conflict) => {
                    report.conflicts += 1;
                    true
                }
                Err(_) => {
                    report.failed += 1;
                    true
                }
            };
            if failed && self.config.failure_policy == FailurePolicy::FailFast {
                report.aborted = true;
                warn!(%key, remaining = keys.len() - report.attempted(), "aborting rollup pass");
                break;
            }
        }

        info!(
            candidates = report.candidates,
            compacted = report.compacted,
            conflicts = report.conflicts,
            failed = report.failed,
            empty = report.empty,
            aborted = report.aborted,
            "rollup pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryInventoryStore;

    fn key() -> InventoryKey {
        InventoryKey::new("SKU-1", 1)
    }

    #[tokio::test]
    async fn prepare_creates_lock_lazily() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let compactor = Compactor::new(store.clone(), RollupMode::Consolidate);
        assert!(store.get_lock(&key()).await.unwrap().is_none());

        let plan = compactor.prepare(&key()).await.unwrap();
        assert_eq!(plan.lock_version, 0);
        assert!(plan.journal_ids.is_empty());
        assert_eq!(plan.sum, None);
        assert!(store.get_lock(&key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_journal_writes_nothing() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let compactor = Compactor::new(store.clone(), RollupMode::Consolidate);

        assert_eq!(compactor.compact(&key()).await.unwrap(), RollupOutcome::Empty);
        assert_eq!(store.journal_len().await, 0);
        assert_eq!(store.get_lock(&key()).await.unwrap().unwrap().lock_count, 0);
    }

    #[tokio::test]
    async fn zero_sum_still_consolidates() {
        let store = Arc::new(InMemoryInventoryStore::new());
        store.append_journal(&NewJournalEntry::new(&key(), 3, 0)).await.unwrap();
        store.append_journal(&NewJournalEntry::new(&key(), -3, 0)).await.unwrap();

        let compactor = Compactor::new(store.clone(), RollupMode::Consolidate);
        let outcome = compactor.compact(&key()).await.unwrap();
        assert_eq!(
            outcome,
            RollupOutcome::Compacted {
                rows: 2,
                sum: RollupResult::new(0, 0),
                version: 1
            }
        );
        let entries = store.journal_entries(&key()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].deltas(), RollupResult::new(0, 0));
    }

    #[test]
    fn report_counts_attempts() {
        let report = RollupReport {
            candidates: 5,
            compacted: 2,
            empty: 1,
            conflicts: 1,
            failed: 0,
            aborted: true,
        };
        assert_eq!(report.attempted(), 4);
    }
}
