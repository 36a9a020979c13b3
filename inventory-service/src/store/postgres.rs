use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use diesel::dsl::{count_star, sum};
use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use shared::InventoryKey;

use super::{is_low_stock, InventoryStore, RolledUpInventory, UnitOfWork, WriteOp};
use crate::error::{StoreError, StoreResult};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Applies pending migrations over a blocking connection.
pub fn run_migrations(database_url: &str) -> StoreResult<()> {
    let mut conn = diesel::PgConnection::establish(database_url)
        .map_err(|e| StoreError::Connection(e.to_string()))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    Ok(())
}

type PooledConn<'a> = bb8::PooledConnection<'a, AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Postgres backend over a bb8 pool of async diesel connections.
#[derive(Clone)]
pub struct PgInventoryStore {
    pool: DbPool,
}

impl PgInventoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .build(config)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(pool))
    }

    async fn conn(&self) -> StoreResult<PooledConn<'_>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }
}

async fn rollup_for_key(conn: &mut AsyncPgConnection, key: &InventoryKey) -> StoreResult<RollupResult> {
    let (allocated, on_hand) = inventory_journal::table
        .filter(inventory_journal::sku_code.eq(&key.sku_code))
        .filter(inventory_journal::warehouse_id.eq(key.warehouse_id))
        .select((
            sum(inventory_journal::allocated_quantity_delta),
            sum(inventory_journal::quantity_on_hand_delta),
        ))
        .first::<(Option<i64>, Option<i64>)>(conn)
        .await?;
    RollupResult::from_sums(allocated, on_hand)
}

async fn load_bases(
    conn: &mut AsyncPgConnection,
    sku_codes: &[String],
    warehouse_id: i64,
) -> StoreResult<Vec<Inventory>> {
    let mut query = inventory::table
        .filter(inventory::warehouse_id.eq(warehouse_id))
        .into_boxed();
    if !sku_codes.is_empty() {
        query = query.filter(inventory::sku_code.eq_any(sku_codes));
    }
    Ok(query.order(inventory::sku_code.asc()).load::<Inventory>(conn).await?)
}

/// Journal sums per SKU in one warehouse; SKUs without journal rows are absent.
async fn rollups_by_sku(
    conn: &mut AsyncPgConnection,
    sku_codes: &[String],
    warehouse_id: i64,
) -> StoreResult<HashMap<String, RollupResult>> {
    let rows = inventory_journal::table
        .filter(inventory_journal::warehouse_id.eq(warehouse_id))
        .filter(inventory_journal::sku_code.eq_any(sku_codes))
        .group_by(inventory_journal::sku_code)
        .select((
            inventory_journal::sku_code,
            sum(inventory_journal::allocated_quantity_delta),
            sum(inventory_journal::quantity_on_hand_delta),
        ))
        .load::<(String, Option<i64>, Option<i64>)>(conn)
        .await?;

    let mut rollups = HashMap::with_capacity(rows.len());
    for (sku_code, allocated, on_hand) in rows {
        rollups.insert(sku_code, RollupResult::from_sums(allocated, on_hand)?);
    }
    Ok(rollups)
}

/// Base rows in a warehouse, each with its journal sum if it has journal rows.
async fn warehouse_snapshot(
    conn: &mut AsyncPgConnection,
    sku_codes: &[String],
    warehouse_id: i64,
) -> StoreResult<Vec<(Inventory, Option<RollupResult>)>> {
    let bases = load_bases(conn, sku_codes, warehouse_id).await?;
    if bases.is_empty() {
        return Ok(Vec::new());
    }
    let present: Vec<String> = bases.iter().map(|b| b.sku_code.clone()).collect();
    let mut rollups = rollups_by_sku(conn, &present, warehouse_id).await?;
    Ok(bases
        .into_iter()
        .map(|base| {
            let rollup = rollups.remove(&base.sku_code);
            (base, rollup)
        })
        .collect())
}

async fn compare_and_swap(
    conn: &mut AsyncPgConnection,
    key: &InventoryKey,
    expected: i64,
    new: i64,
) -> StoreResult<bool> {
    let updated = diesel::update(
        inventory_journal_lock::table
            .filter(inventory_journal_lock::sku_code.eq(&key.sku_code))
            .filter(inventory_journal_lock::warehouse_id.eq(key.warehouse_id))
            .filter(inventory_journal_lock::lock_count.eq(expected)),
    )
    .set(inventory_journal_lock::lock_count.eq(new))
    .execute(conn)
    .await?;
    Ok(updated == 1)
}

async fn apply_op(conn: &mut AsyncPgConnection, op: WriteOp) -> StoreResult<()> {
    match op {
        WriteOp::AppendJournal(entry) => {
            diesel::insert_into(inventory_journal::table)
                .values(&entry)
                .execute(conn)
                .await?;
        }
        WriteOp::DeleteJournal(ids) => {
            diesel::delete(inventory_journal::table.filter(inventory_journal::id.eq_any(ids)))
                .execute(conn)
                .await?;
        }
        WriteOp::CasLock { key, expected, new } => {
            if !compare_and_swap(conn, &key, expected, new).await? {
                return Err(StoreError::Conflict(key));
            }
        }
        WriteOp::MergeIntoBase { key, rollup } => {
            let updated = diesel::update(
                inventory::table
                    .filter(inventory::sku_code.eq(&key.sku_code))
                    .filter(inventory::warehouse_id.eq(key.warehouse_id)),
            )
            .set((
                inventory::quantity_on_hand.eq(inventory::quantity_on_hand + rollup.quantity_on_hand_delta),
                inventory::allocated_quantity.eq(inventory::allocated_quantity + rollup.allocated_quantity_delta),
                inventory::updated_at.eq(Some(Utc::now())),
            ))
            .execute(conn)
            .await?;
            if updated == 0 {
                return Err(StoreError::Conflict(key));
            }
        }
        WriteOp::DeleteLock(key) => {
            diesel::delete(
                inventory_journal_lock::table
                    .filter(inventory_journal_lock::sku_code.eq(&key.sku_code))
                    .filter(inventory_journal_lock::warehouse_id.eq(key.warehouse_id)),
            )
            .execute(conn)
            .await?;
        }
        WriteOp::DeleteJournalByKey(key) => {
            diesel::delete(
                inventory_journal::table
                    .filter(inventory_journal::sku_code.eq(&key.sku_code))
                    .filter(inventory_journal::warehouse_id.eq(key.warehouse_id)),
            )
            .execute(conn)
            .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl InventoryStore for PgInventoryStore {
    async fn get_base(&self, key: &InventoryKey) -> StoreResult<Option<Inventory>> {
        let mut conn = self.conn().await?;
        let base = inventory::table
            .filter(inventory::sku_code.eq(&key.sku_code))
            .filter(inventory::warehouse_id.eq(key.warehouse_id))
            .first::<Inventory>(&mut *conn)
            .await
            .optional()?;
        Ok(base)
    }

    async fn put_base(&self, base: &Inventory) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(inventory::table)
            .values(base)
            .on_conflict((inventory::sku_code, inventory::warehouse_id))
            .do_update()
            .set(base)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete_base(&self, key: &InventoryKey) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(
            inventory::table
                .filter(inventory::sku_code.eq(&key.sku_code))
                .filter(inventory::warehouse_id.eq(key.warehouse_id)),
        )
        .execute(&mut *conn)
        .await?;
        Ok(deleted > 0)
    }

    async fn append_journal(&self, entry: &NewJournalEntry) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let id = diesel::insert_into(inventory_journal::table)
            .values(entry)
            .returning(inventory_journal::id)
            .get_result::<i64>(&mut *conn)
            .await?;
        Ok(id)
    }

    async fn live_journal_ids(&self, key: &InventoryKey) -> StoreResult<Vec<i64>> {
        let mut conn = self.conn().await?;
        let ids = inventory_journal::table
            .filter(inventory_journal::sku_code.eq(&key.sku_code))
            .filter(inventory_journal::warehouse_id.eq(key.warehouse_id))
            .select(inventory_journal::id)
            .order(inventory_journal::id.asc())
            .load::<i64>(&mut *conn)
            .await?;
        Ok(ids)
    }

    async fn sum_journal(&self, ids: &[i64]) -> StoreResult<Option<RollupResult>> {
        if ids.is_empty() {
            return Ok(None);
        }
        let mut conn = self.conn().await?;
        let (rows, allocated, on_hand) = inventory_journal::table
            .filter(inventory_journal::id.eq_any(ids))
            .select((
                count_star(),
                sum(inventory_journal::allocated_quantity_delta),
                sum(inventory_journal::quantity_on_hand_delta),
            ))
            .first::<(i64, Option<i64>, Option<i64>)>(&mut *conn)
            .await?;
        if rows == 0 {
            return Ok(None);
        }
        RollupResult::from_sums(allocated, on_hand).map(Some)
    }

    async fn delete_journal(&self, ids: &[i64]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(inventory_journal::table.filter(inventory_journal::id.eq_any(ids)))
            .execute(&mut *conn)
            .await?;
        Ok(deleted as u64)
    }

    async fn delete_journal_by_key(&self, key: &InventoryKey) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(
            inventory_journal::table
                .filter(inventory_journal::sku_code.eq(&key.sku_code))
                .filter(inventory_journal::warehouse_id.eq(key.warehouse_id)),
        )
        .execute(&mut *conn)
        .await?;
        Ok(deleted as u64)
    }

    async fn keys_needing_rollup(&self, min_rows: usize) -> StoreResult<Vec<InventoryKey>> {
        let mut conn = self.conn().await?;
        let threshold = i64::try_from(min_rows).unwrap_or(i64::MAX);
        let keys = inventory_journal::table
            .group_by((inventory_journal::sku_code, inventory_journal::warehouse_id))
            .having(count_star().ge(threshold))
            .select((inventory_journal::sku_code, inventory_journal::warehouse_id))
            .order((inventory_journal::sku_code.asc(), inventory_journal::warehouse_id.asc()))
            .load::<(String, i64)>(&mut *conn)
            .await?;
        Ok(keys
            .into_iter()
            .map(|(sku_code, warehouse_id)| InventoryKey::new(sku_code, warehouse_id))
            .collect())
    }

    async fn get_lock(&self, key: &InventoryKey) -> StoreResult<Option<JournalLock>> {
        let mut conn = self.conn().await?;
        let lock = inventory_journal_lock::table
            .filter(inventory_journal_lock::sku_code.eq(&key.sku_code))
            .filter(inventory_journal_lock::warehouse_id.eq(key.warehouse_id))
            .first::<JournalLock>(&mut *conn)
            .await
            .optional()?;
        Ok(lock)
    }

    async fn create_lock(&self, key: &InventoryKey) -> StoreResult<JournalLock> {
        {
            let mut conn = self.conn().await?;
            diesel::insert_into(inventory_journal_lock::table)
                .values(&JournalLock::new(key))
                .on_conflict_do_nothing()
                .execute(&mut *conn)
                .await?;
        }
        self.get_lock(key)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("journal lock for {} vanished after insert", key)))
    }

    async fn cas_lock(&self, key: &InventoryKey, expected: i64, new: i64) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        compare_and_swap(&mut conn, key, expected, new).await
    }

    async fn delete_lock(&self, key: &InventoryKey) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(
            inventory_journal_lock::table
                .filter(inventory_journal_lock::sku_code.eq(&key.sku_code))
                .filter(inventory_journal_lock::warehouse_id.eq(key.warehouse_id)),
        )
        .execute(&mut *conn)
        .await?;
        Ok(deleted > 0)
    }

    async fn commit(&self, work: UnitOfWork) -> StoreResult<()> {
        if work.is_empty() {
            return Ok(());
        }
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let ops = work.into_ops();

        conn.transaction::<_, StoreError, _>(|conn| {
            Box::pin(async move {
                for op in ops {
                    apply_op(conn, op).await?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn inventory_with_rollup(&self, key: &InventoryKey) -> StoreResult<Option<RolledUpInventory>> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let key = key.clone();

        conn.build_transaction()
            .read_only()
            .repeatable_read()
            .run::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    let base = inventory::table
                        .filter(inventory::sku_code.eq(&key.sku_code))
                        .filter(inventory::warehouse_id.eq(key.warehouse_id))
                        .first::<Inventory>(conn)
                        .await
                        .optional()?;
                    match base {
                        Some(base) => {
                            let rollup = rollup_for_key(conn, &key).await?;
                            Ok(Some((base, rollup)))
                        }
                        None => Ok(None),
                    }
                })
            })
            .await
    }

    async fn inventories_with_rollups_in_warehouse(
        &self,
        sku_codes: &[String],
        warehouse_id: i64,
    ) -> StoreResult<Vec<RolledUpInventory>> {
        if sku_codes.is_empty() {
            return Ok(Vec::new());
        }
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let sku_codes = sku_codes.to_vec();

        conn.build_transaction()
            .read_only()
            .repeatable_read()
            .run::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    let rows = warehouse_snapshot(conn, &sku_codes, warehouse_id).await?;
                    Ok(rows
                        .into_iter()
                        .map(|(base, rollup)| (base, rollup.unwrap_or_default()))
                        .collect())
                })
            })
            .await
    }

    async fn inventories_with_rollups_for_sku(&self, sku_code: &str) -> StoreResult<Vec<RolledUpInventory>> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let sku_code = sku_code.to_string();

        conn.build_transaction()
            .read_only()
            .repeatable_read()
            .run::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    let bases = inventory::table
                        .filter(inventory::sku_code.eq(&sku_code))
                        .order(inventory::warehouse_id.asc())
                        .load::<Inventory>(conn)
                        .await?;
                    let sums = inventory_journal::table
                        .filter(inventory_journal::sku_code.eq(&sku_code))
                        .group_by(inventory_journal::warehouse_id)
                        .select((
                            inventory_journal::warehouse_id,
                            sum(inventory_journal::allocated_quantity_delta),
                            sum(inventory_journal::quantity_on_hand_delta),
                        ))
                        .load::<(i64, Option<i64>, Option<i64>)>(conn)
                        .await?;

                    let mut rollups = HashMap::with_capacity(sums.len());
                    for (warehouse_id, allocated, on_hand) in sums {
                        rollups.insert(warehouse_id, RollupResult::from_sums(allocated, on_hand)?);
                    }
                    Ok(bases
                        .into_iter()
                        .map(|base| {
                            let rollup = rollups.remove(&base.warehouse_id).unwrap_or_default();
                            (base, rollup)
                        })
                        .collect())
                })
            })
            .await
    }

    async fn low_stock_base(&self, sku_codes: &[String], warehouse_id: i64) -> StoreResult<Vec<RolledUpInventory>> {
        let mut conn = self.conn().await?;
        let none = RollupResult::default();
        let bases = load_bases(&mut conn, sku_codes, warehouse_id).await?;
        Ok(bases
            .into_iter()
            .filter(|base| is_low_stock(base, &none))
            .map(|base| (base, none))
            .collect())
    }

    async fn low_stock_journaled(
        &self,
        sku_codes: &[String],
        warehouse_id: i64,
    ) -> StoreResult<Vec<RolledUpInventory>> {
        let mut pooled = self.conn().await?;
        let conn: &mut AsyncPgConnection = &mut pooled;
        let sku_codes = sku_codes.to_vec();

        conn.build_transaction()
            .read_only()
            .repeatable_read()
            .run::<_, StoreError, _>(|conn| {
                Box::pin(async move {
                    let rows = warehouse_snapshot(conn, &sku_codes, warehouse_id).await?;
                    Ok(rows
                        .into_iter()
                        .filter_map(|(base, rollup)| rollup.map(|rollup| (base, rollup)))
                        .filter(|(base, rollup)| is_low_stock(base, rollup))
                        .collect())
                })
            })
            .await
    }

    async fn processed_command(&self, idempotency_key: &str) -> StoreResult<Option<ProcessedCommand>> {
        let mut conn = self.conn().await?;
        let result = processed_commands::table
            .filter(processed_commands::idempotency_key.eq(idempotency_key))
            .first::<ProcessedCommand>(&mut *conn)
            .await
            .optional()?;
        Ok(result)
    }

    async fn record_processed_command(&self, record: &ProcessedCommand) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(processed_commands::table)
            .values(record)
            .on_conflict_do_nothing()
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
