//! SQLite storage backend for ChainKeys.
//!
//! Persists modules, operators, keys, validators and checkpoints to a single
//! SQLite file. Uses `sqlx` with WAL mode so readers keep a consistent
//! snapshot while a pass commits.
//!
//! # Usage
//! ```rust,no_run
//! use chainkeys_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./keys.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::time::Duration;
use tracing::debug;

use chainkeys_core::checkpoint::ElMeta;
use chainkeys_core::consensus::{ConsensusMeta, Validator, ValidatorStatus};
use chainkeys_core::config::SyncConfig;
use chainkeys_core::error::{Result, SyncError};
use chainkeys_core::store::{KeyStream, ModuleUpdate, PassCommit, SyncStore};
use chainkeys_core::types::{Key, KeyFilter, ModuleStatus, Operator, OperatorFilter, StakingModule};

use crate::cursor::spawn_cursor;
use crate::DEFAULT_MAX_ROWS_PER_STATEMENT;

fn storage_err(e: sqlx::Error) -> SyncError {
    SyncError::Storage(e.to_string())
}

/// SQLite-backed mirror storage.
pub struct SqliteStorage {
    pool: SqlitePool,
    max_rows: usize,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./keys.db"`) or a full
    /// SQLite URL (`"sqlite:./keys.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let storage = Self {
            pool,
            max_rows: DEFAULT_MAX_ROWS_PER_STATEMENT,
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self> {
        // Pool connections share one in-memory database; keeping a connection
        // open keeps the database alive.
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let storage = Self {
            pool,
            max_rows: DEFAULT_MAX_ROWS_PER_STATEMENT,
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Rows per multi-row INSERT statement.
    pub fn with_max_rows_per_statement(mut self, rows: usize) -> Self {
        self.max_rows = rows.max(1);
        self
    }

    /// Apply the storage settings of `config`.
    pub fn with_config(self, config: &SyncConfig) -> Self {
        self.with_max_rows_per_statement(config.max_rows_per_statement)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        let statements = [
            "CREATE TABLE IF NOT EXISTS chainkeys_el_meta (
                block_number            INTEGER NOT NULL,
                block_hash              TEXT    NOT NULL,
                timestamp               INTEGER NOT NULL,
                last_changed_block_hash TEXT    NOT NULL,
                updated_at              INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS chainkeys_modules (
                id                      INTEGER PRIMARY KEY,
                staking_module_address  TEXT    NOT NULL,
                module_fee              INTEGER NOT NULL,
                treasury_fee            INTEGER NOT NULL,
                target_share            INTEGER NOT NULL,
                status                  TEXT    NOT NULL,
                name                    TEXT    NOT NULL,
                last_deposit_at         INTEGER NOT NULL,
                last_deposit_block      INTEGER NOT NULL,
                exited_validators_count INTEGER NOT NULL,
                module_type             TEXT    NOT NULL,
                active                  INTEGER NOT NULL,
                nonce                   INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS chainkeys_operators (
                module_address     TEXT    NOT NULL,
                operator_index     INTEGER NOT NULL,
                active             INTEGER NOT NULL,
                name               TEXT    NOT NULL,
                reward_address     TEXT    NOT NULL,
                staking_limit      INTEGER NOT NULL,
                stopped_validators INTEGER NOT NULL,
                total_signing_keys INTEGER NOT NULL,
                used_signing_keys  INTEGER NOT NULL,
                PRIMARY KEY (module_address, operator_index)
            );",
            "CREATE TABLE IF NOT EXISTS chainkeys_keys (
                module_address    TEXT    NOT NULL,
                operator_index    INTEGER NOT NULL,
                key_index         INTEGER NOT NULL,
                pubkey            TEXT    NOT NULL,
                deposit_signature TEXT    NOT NULL,
                used              INTEGER NOT NULL,
                PRIMARY KEY (module_address, operator_index, key_index)
            );",
            "CREATE INDEX IF NOT EXISTS idx_keys_pubkey ON chainkeys_keys (pubkey);",
            "CREATE TABLE IF NOT EXISTS chainkeys_consensus_meta (
                slot         INTEGER NOT NULL,
                epoch        INTEGER NOT NULL,
                state_root   TEXT    NOT NULL,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                timestamp    INTEGER NOT NULL
            );",
            "CREATE TABLE IF NOT EXISTS chainkeys_validators (
                validator_index INTEGER NOT NULL,
                pubkey          TEXT    PRIMARY KEY,
                status          TEXT    NOT NULL
            );",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(storage_err)?;
        }
        Ok(())
    }

    // ─── Pass writes ────────────────────────────────────────────────────────────

    async fn upsert_modules(&self, conn: &mut SqliteConnection, modules: &[StakingModule]) -> Result<()> {
        for chunk in modules.chunks(self.max_rows) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO chainkeys_modules (id, staking_module_address, module_fee, \
                 treasury_fee, target_share, status, name, last_deposit_at, last_deposit_block, \
                 exited_validators_count, module_type, active, nonce) ",
            );
            qb.push_values(chunk, |mut b, m| {
                b.push_bind(m.id as i64)
                    .push_bind(m.staking_module_address.clone())
                    .push_bind(m.module_fee as i64)
                    .push_bind(m.treasury_fee as i64)
                    .push_bind(m.target_share as i64)
                    .push_bind(m.status.as_str())
                    .push_bind(m.name.clone())
                    .push_bind(m.last_deposit_at)
                    .push_bind(m.last_deposit_block as i64)
                    .push_bind(m.exited_validators_count as i64)
                    .push_bind(m.module_type.clone())
                    .push_bind(m.active)
                    .push_bind(m.nonce as i64);
            });
            qb.push(
                " ON CONFLICT (id) DO UPDATE SET \
                 staking_module_address = excluded.staking_module_address, \
                 module_fee = excluded.module_fee, treasury_fee = excluded.treasury_fee, \
                 target_share = excluded.target_share, status = excluded.status, \
                 name = excluded.name, last_deposit_at = excluded.last_deposit_at, \
                 last_deposit_block = excluded.last_deposit_block, \
                 exited_validators_count = excluded.exited_validators_count, \
                 module_type = excluded.module_type, active = excluded.active, \
                 nonce = excluded.nonce",
            );
            qb.build().execute(&mut *conn).await.map_err(storage_err)?;
        }
        Ok(())
    }

    async fn apply_update(&self, conn: &mut SqliteConnection, update: &ModuleUpdate) -> Result<()> {
        let module = update.module_address.as_str();

        sqlx::query("DELETE FROM chainkeys_operators WHERE module_address = ?")
            .bind(module)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        for chunk in update.operators.chunks(self.max_rows) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO chainkeys_operators (module_address, operator_index, active, name, \
                 reward_address, staking_limit, stopped_validators, total_signing_keys, \
                 used_signing_keys) ",
            );
            qb.push_values(chunk, |mut b, op| {
                b.push_bind(op.module_address.clone())
                    .push_bind(op.index as i64)
                    .push_bind(op.active)
                    .push_bind(op.name.clone())
                    .push_bind(op.reward_address.clone())
                    .push_bind(op.staking_limit as i64)
                    .push_bind(op.stopped_validators as i64)
                    .push_bind(op.total_signing_keys as i64)
                    .push_bind(op.used_signing_keys as i64);
            });
            qb.build().execute(&mut *conn).await.map_err(storage_err)?;
        }

        // Keys of operators that no longer exist.
        sqlx::query("DELETE FROM chainkeys_keys WHERE module_address = ? AND operator_index >= ?")
            .bind(module)
            .bind(update.operators.len() as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        for (operator_index, limit) in &update.key_limits {
            sqlx::query(
                "DELETE FROM chainkeys_keys
                 WHERE module_address = ? AND operator_index = ? AND key_index >= ?",
            )
            .bind(module)
            .bind(*operator_index as i64)
            .bind(*limit as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;
        }

        for chunk in update.keys.chunks(self.max_rows) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO chainkeys_keys (module_address, operator_index, key_index, pubkey, \
                 deposit_signature, used) ",
            );
            qb.push_values(chunk, |mut b, key| {
                b.push_bind(key.module_address.clone())
                    .push_bind(key.operator_index as i64)
                    .push_bind(key.index as i64)
                    .push_bind(key.key.clone())
                    .push_bind(key.deposit_signature.clone())
                    .push_bind(key.used);
            });
            qb.push(
                " ON CONFLICT (module_address, operator_index, key_index) DO UPDATE SET \
                 pubkey = excluded.pubkey, deposit_signature = excluded.deposit_signature, \
                 used = excluded.used",
            );
            qb.build().execute(&mut *conn).await.map_err(storage_err)?;
        }

        debug!(
            module,
            operators = update.operators.len(),
            keys = update.keys.len(),
            "module update written"
        );
        Ok(())
    }
}

// ─── Row decoding ─────────────────────────────────────────────────────────────

fn get_u64(row: &SqliteRow, column: &str) -> Result<u64> {
    let v: i64 = row.try_get(column).map_err(storage_err)?;
    u64::try_from(v).map_err(|_| SyncError::Storage(format!("negative {column}: {v}")))
}

fn get_u32(row: &SqliteRow, column: &str) -> Result<u32> {
    let v = get_u64(row, column)?;
    u32::try_from(v).map_err(|_| SyncError::Storage(format!("{column} out of range: {v}")))
}

fn el_meta_from_row(row: &SqliteRow) -> Result<ElMeta> {
    Ok(ElMeta {
        block_number: get_u64(row, "block_number")?,
        block_hash: row.try_get("block_hash").map_err(storage_err)?,
        timestamp: row.try_get("timestamp").map_err(storage_err)?,
        last_changed_block_hash: row.try_get("last_changed_block_hash").map_err(storage_err)?,
    })
}

fn module_from_row(row: &SqliteRow) -> Result<StakingModule> {
    let status: String = row.try_get("status").map_err(storage_err)?;
    Ok(StakingModule {
        id: get_u32(row, "id")?,
        staking_module_address: row.try_get("staking_module_address").map_err(storage_err)?,
        module_fee: get_u32(row, "module_fee")?,
        treasury_fee: get_u32(row, "treasury_fee")?,
        target_share: get_u32(row, "target_share")?,
        status: ModuleStatus::parse(&status)
            .ok_or_else(|| SyncError::Decode(format!("module status {status}")))?,
        name: row.try_get("name").map_err(storage_err)?,
        last_deposit_at: row.try_get("last_deposit_at").map_err(storage_err)?,
        last_deposit_block: get_u64(row, "last_deposit_block")?,
        exited_validators_count: get_u64(row, "exited_validators_count")?,
        module_type: row.try_get("module_type").map_err(storage_err)?,
        active: row.try_get("active").map_err(storage_err)?,
        nonce: get_u64(row, "nonce")?,
    })
}

fn operator_from_row(row: &SqliteRow) -> Result<Operator> {
    Ok(Operator {
        module_address: row.try_get("module_address").map_err(storage_err)?,
        index: get_u64(row, "operator_index")?,
        active: row.try_get("active").map_err(storage_err)?,
        name: row.try_get("name").map_err(storage_err)?,
        reward_address: row.try_get("reward_address").map_err(storage_err)?,
        staking_limit: get_u64(row, "staking_limit")?,
        stopped_validators: get_u64(row, "stopped_validators")?,
        total_signing_keys: get_u64(row, "total_signing_keys")?,
        used_signing_keys: get_u64(row, "used_signing_keys")?,
    })
}

fn key_from_row(row: &SqliteRow) -> Result<Key> {
    Ok(Key {
        module_address: row.try_get("module_address").map_err(storage_err)?,
        operator_index: get_u64(row, "operator_index")?,
        index: get_u64(row, "key_index")?,
        key: row.try_get("pubkey").map_err(storage_err)?,
        deposit_signature: row.try_get("deposit_signature").map_err(storage_err)?,
        used: row.try_get("used").map_err(storage_err)?,
    })
}

fn consensus_meta_from_row(row: &SqliteRow) -> Result<ConsensusMeta> {
    Ok(ConsensusMeta {
        slot: get_u64(row, "slot")?,
        epoch: get_u64(row, "epoch")?,
        state_root: row.try_get("state_root").map_err(storage_err)?,
        block_number: get_u64(row, "block_number")?,
        block_hash: row.try_get("block_hash").map_err(storage_err)?,
        timestamp: row.try_get("timestamp").map_err(storage_err)?,
    })
}

fn validator_from_row(row: &SqliteRow) -> Result<Validator> {
    let status: String = row.try_get("status").map_err(storage_err)?;
    Ok(Validator {
        index: get_u64(row, "validator_index")?,
        pubkey: row.try_get("pubkey").map_err(storage_err)?,
        status: ValidatorStatus::parse(&status)
            .ok_or_else(|| SyncError::Decode(format!("validator status {status}")))?,
    })
}

// ─── Shared reads ─────────────────────────────────────────────────────────────

async fn read_el_meta(conn: &mut SqliteConnection) -> Result<Option<ElMeta>> {
    let row = sqlx::query(
        "SELECT block_number, block_hash, timestamp, last_changed_block_hash
         FROM chainkeys_el_meta LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_err)?;
    row.as_ref().map(el_meta_from_row).transpose()
}

async fn read_consensus_meta(conn: &mut SqliteConnection) -> Result<Option<ConsensusMeta>> {
    let row = sqlx::query(
        "SELECT slot, epoch, state_root, block_number, block_hash, timestamp
         FROM chainkeys_consensus_meta LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_err)?;
    row.as_ref().map(consensus_meta_from_row).transpose()
}

fn keys_query(module: &str, filter: KeyFilter) -> QueryBuilder<'static, Sqlite> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT module_address, operator_index, key_index, pubkey, deposit_signature, used
         FROM chainkeys_keys WHERE module_address = ",
    );
    qb.push_bind(module.to_string());
    if let Some(op) = filter.operator_index {
        qb.push(" AND operator_index = ").push_bind(op as i64);
    }
    if let Some(used) = filter.used {
        qb.push(" AND used = ").push_bind(used);
    }
    qb.push(" ORDER BY operator_index, key_index");
    qb
}

// ─── SyncStore ────────────────────────────────────────────────────────────────

#[async_trait]
impl SyncStore for SqliteStorage {
    async fn el_meta(&self) -> Result<Option<ElMeta>> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        read_el_meta(&mut conn).await
    }

    async fn staking_modules(&self) -> Result<Vec<StakingModule>> {
        let rows = sqlx::query("SELECT * FROM chainkeys_modules ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;
        rows.iter().map(module_from_row).collect()
    }

    async fn operators(&self, module: &str) -> Result<Vec<Operator>> {
        let rows = sqlx::query(
            "SELECT * FROM chainkeys_operators WHERE module_address = ? ORDER BY operator_index",
        )
        .bind(module)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(operator_from_row).collect()
    }

    async fn commit_pass(&self, commit: PassCommit) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        self.upsert_modules(&mut tx, &commit.modules).await?;
        for update in &commit.updates {
            self.apply_update(&mut tx, update).await?;
        }

        sqlx::query("DELETE FROM chainkeys_el_meta")
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        sqlx::query(
            "INSERT INTO chainkeys_el_meta
             (block_number, block_hash, timestamp, last_changed_block_hash, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(commit.meta.block_number as i64)
        .bind(&commit.meta.block_hash)
        .bind(commit.meta.timestamp)
        .bind(&commit.meta.last_changed_block_hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        debug!(
            block = commit.meta.block_number,
            updated = commit.updates.len(),
            "pass committed"
        );
        Ok(())
    }

    async fn operators_snapshot(
        &self,
        module: &str,
        filter: OperatorFilter,
    ) -> Result<(Vec<Operator>, Option<ElMeta>)> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let rows = match filter.index {
            Some(index) => sqlx::query(
                "SELECT * FROM chainkeys_operators
                 WHERE module_address = ? AND operator_index = ?",
            )
            .bind(module)
            .bind(index as i64)
            .fetch_all(&mut *tx)
            .await,
            None => sqlx::query(
                "SELECT * FROM chainkeys_operators
                 WHERE module_address = ? ORDER BY operator_index",
            )
            .bind(module)
            .fetch_all(&mut *tx)
            .await,
        }
        .map_err(storage_err)?;
        let operators = rows.iter().map(operator_from_row).collect::<Result<Vec<_>>>()?;
        let meta = read_el_meta(&mut tx).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok((operators, meta))
    }

    async fn keys_snapshot(
        &self,
        module: &str,
        filter: KeyFilter,
    ) -> Result<(Vec<Key>, Option<ElMeta>)> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let rows = keys_query(module, filter)
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_err)?;
        let keys = rows.iter().map(key_from_row).collect::<Result<Vec<_>>>()?;
        let meta = read_el_meta(&mut tx).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok((keys, meta))
    }

    async fn stream_keys(
        &self,
        module: &str,
        filter: KeyFilter,
        idle: Duration,
    ) -> Result<KeyStream> {
        let pool = self.pool.clone();
        let module = module.to_string();
        Ok(spawn_cursor(idle, move |sink| async move {
            let mut qb = keys_query(&module, filter);
            let mut rows = qb.build().fetch(&pool);
            loop {
                let item = match rows.try_next().await {
                    Ok(Some(row)) => key_from_row(&row),
                    Ok(None) => break,
                    Err(e) => Err(storage_err(e)),
                };
                let failed = item.is_err();
                if !sink.send(item).await || failed {
                    break;
                }
            }
        }))
    }

    async fn consensus_meta(&self) -> Result<Option<ConsensusMeta>> {
        let mut conn = self.pool.acquire().await.map_err(storage_err)?;
        read_consensus_meta(&mut conn).await
    }

    async fn commit_validators(
        &self,
        meta: ConsensusMeta,
        validators: Vec<Validator>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        sqlx::query("DELETE FROM chainkeys_validators")
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        for chunk in validators.chunks(self.max_rows) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO chainkeys_validators (validator_index, pubkey, status) ");
            qb.push_values(chunk, |mut b, v| {
                b.push_bind(v.index as i64)
                    .push_bind(v.pubkey.clone())
                    .push_bind(v.status.as_str());
            });
            qb.build().execute(&mut *tx).await.map_err(storage_err)?;
        }

        sqlx::query("DELETE FROM chainkeys_consensus_meta")
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        sqlx::query(
            "INSERT INTO chainkeys_consensus_meta
             (slot, epoch, state_root, block_number, block_hash, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(meta.slot as i64)
        .bind(meta.epoch as i64)
        .bind(&meta.state_root)
        .bind(meta.block_number as i64)
        .bind(&meta.block_hash)
        .bind(meta.timestamp)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        debug!(slot = meta.slot, validators = validators.len(), "validators committed");
        Ok(())
    }

    async fn validators(&self) -> Result<(Vec<Validator>, Option<ConsensusMeta>)> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let rows = sqlx::query(
            "SELECT validator_index, pubkey, status FROM chainkeys_validators
             ORDER BY validator_index",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(storage_err)?;
        let validators = rows.iter().map(validator_from_row).collect::<Result<Vec<_>>>()?;
        let meta = read_consensus_meta(&mut tx).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok((validators, meta))
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        for table in [
            "chainkeys_keys",
            "chainkeys_operators",
            "chainkeys_modules",
            "chainkeys_el_meta",
            "chainkeys_validators",
            "chainkeys_consensus_meta",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
