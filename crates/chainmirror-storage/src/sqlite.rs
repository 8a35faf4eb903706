//! SQLite persistence gateway for ChainMirror.
//!
//! Same tables and natural keys as the PostgreSQL gateway, in a single file.
//! Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use chainmirror_core::WriteMode;
//! use chainmirror_storage::sqlite::SqliteGateway;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let gateway = SqliteGateway::open("./mina.db", WriteMode::Live).await?;
//!
//! // In-memory (tests / ephemeral)
//! let gateway = SqliteGateway::in_memory(WriteMode::Live).await?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use tracing::debug;

use chainmirror_core::{
    Balance, Block, ChainStatus, FeeTransfer, MirrorError, NormalizedBlock, PersistenceGateway,
    RowCounts, StoredBlock, Transaction, WriteMode,
};

use crate::error::db_error;
use crate::{opt_i64, parse_status, to_i64};

const STATUS_TABLES: [&str; 4] = ["blocks", "transactions", "fee_transfers", "balances"];

/// SQLite-backed [`PersistenceGateway`].
pub struct SqliteGateway {
    pool: SqlitePool,
    mode: WriteMode,
}

impl SqliteGateway {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./mina.db"`) or a full
    /// SQLite URL (`"sqlite:./mina.db"`). A missing database file is created.
    pub async fn open(path: &str, mode: WriteMode) -> Result<Self, MirrorError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| db_error("sqlite url", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(|e| db_error("sqlite open", e))?;

        let gateway = Self { pool, mode };
        gateway.init_schema().await?;
        Ok(gateway)
    }

    /// Open an in-memory SQLite database.
    ///
    /// A single long-lived connection holds the data; it is lost when the
    /// gateway is dropped.
    pub async fn in_memory(mode: WriteMode) -> Result<Self, MirrorError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_error("sqlite open", e))?;

        let gateway = Self { pool, mode };
        gateway.init_schema().await?;
        Ok(gateway)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), MirrorError> {
        let statements = [
            // WAL lets readers run alongside the writer
            "PRAGMA journal_mode=WAL;",
            "CREATE TABLE IF NOT EXISTS blocks (
                height                    INTEGER NOT NULL,
                block_hash                TEXT    NOT NULL,
                chain_status              TEXT    NOT NULL,
                creator                   TEXT    NOT NULL,
                parent_hash               TEXT    NOT NULL,
                timestamp                 TEXT    NOT NULL,
                coinbase_amount           INTEGER NOT NULL,
                coinbase_receiver         TEXT    NOT NULL,
                snarked_ledger_hash       TEXT    NOT NULL,
                staged_ledger_hash        TEXT    NOT NULL,
                epoch                     INTEGER NOT NULL,
                slot                      INTEGER NOT NULL,
                global_slot_since_genesis INTEGER NOT NULL,
                total_currency            INTEGER NOT NULL,
                num_transactions          INTEGER NOT NULL,
                num_fee_transfers         INTEGER NOT NULL,
                num_zkapp_transactions    INTEGER NOT NULL,
                PRIMARY KEY (height, block_hash)
            );",
            "CREATE TABLE IF NOT EXISTS transactions (
                height         INTEGER NOT NULL,
                block_hash     TEXT    NOT NULL,
                tx_hash        TEXT    NOT NULL,
                chain_status   TEXT    NOT NULL,
                kind           TEXT    NOT NULL,
                source         TEXT    NOT NULL,
                receiver       TEXT    NOT NULL,
                fee_payer      TEXT    NOT NULL,
                token          TEXT,
                fee_token      TEXT,
                amount         INTEGER NOT NULL,
                fee            INTEGER NOT NULL,
                memo           TEXT,
                nonce          INTEGER,
                failure_reason TEXT,
                PRIMARY KEY (block_hash, tx_hash)
            );",
            "CREATE TABLE IF NOT EXISTS fee_transfers (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                height       INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                chain_status TEXT    NOT NULL,
                receiver     TEXT    NOT NULL,
                amount       INTEGER NOT NULL,
                kind         TEXT,
                UNIQUE (block_hash, receiver, amount)
            );",
            "CREATE TABLE IF NOT EXISTS balances (
                public_key   TEXT    NOT NULL,
                height       INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                chain_status TEXT    NOT NULL,
                total        INTEGER NOT NULL,
                locked       INTEGER,
                liquid       INTEGER,
                PRIMARY KEY (public_key, block_hash)
            );",
            "CREATE INDEX IF NOT EXISTS idx_blocks_height ON blocks (height);",
            "CREATE INDEX IF NOT EXISTS idx_blocks_block_hash ON blocks (block_hash);",
            "CREATE INDEX IF NOT EXISTS idx_transactions_block_hash ON transactions (block_hash);",
            "CREATE INDEX IF NOT EXISTS idx_fee_transfers_block_hash ON fee_transfers (block_hash);",
            "CREATE INDEX IF NOT EXISTS idx_balances_block_hash ON balances (block_hash);",
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("init schema", e))?;
        }
        Ok(())
    }

    fn skip(&self, what: &str, key: &str) -> bool {
        if self.mode.writes_enabled() {
            return false;
        }
        debug!(what, key, mode = %self.mode, "write skipped");
        true
    }

    /// Row counts of the four mirrored tables.
    pub async fn row_counts(&self) -> Result<RowCounts, MirrorError> {
        let mut counts = [0usize; 4];
        for (slot, table) in counts.iter_mut().zip(STATUS_TABLES) {
            let n: i64 = sqlx::query(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .and_then(|r| r.try_get(0))
                .map_err(|e| db_error("row counts", e))?;
            *slot = n as usize;
        }
        let [blocks, transactions, fee_transfers, balances] = counts;
        Ok(RowCounts {
            blocks,
            transactions,
            fee_transfers,
            balances,
        })
    }

    /// Stored status of one block, if present.
    pub async fn block_status(
        &self,
        height: u64,
        block_hash: &str,
    ) -> Result<Option<ChainStatus>, MirrorError> {
        let row = sqlx::query("SELECT chain_status FROM blocks WHERE height = ? AND block_hash = ?")
            .bind(to_i64(height, "height")?)
            .bind(block_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("block status", e))?;

        row.map(|r| parse_status(&r.get::<String, _>("chain_status")))
            .transpose()
    }

    /// Status of every child row of `block_hash`, table by table.
    pub async fn child_statuses(
        &self,
        block_hash: &str,
    ) -> Result<Vec<(&'static str, ChainStatus)>, MirrorError> {
        let mut out = Vec::new();
        for table in &STATUS_TABLES[1..] {
            let rows = sqlx::query(&format!(
                "SELECT chain_status FROM {table} WHERE block_hash = ?"
            ))
            .bind(block_hash)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("child statuses", e))?;
            for r in rows {
                out.push((*table, parse_status(&r.get::<String, _>("chain_status"))?));
            }
        }
        Ok(out)
    }
}

// ─── Row writers (pool or transaction) ────────────────────────────────────────

async fn insert_block_row<'e>(exec: impl SqliteExecutor<'e>, b: &Block) -> Result<bool, MirrorError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO blocks
            (height, block_hash, chain_status, creator, parent_hash, timestamp,
             coinbase_amount, coinbase_receiver, snarked_ledger_hash, staged_ledger_hash,
             epoch, slot, global_slot_since_genesis, total_currency,
             num_transactions, num_fee_transfers, num_zkapp_transactions)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(to_i64(b.height, "height")?)
    .bind(&b.block_hash)
    .bind(b.chain_status.as_str())
    .bind(&b.creator)
    .bind(&b.parent_hash)
    .bind(b.timestamp)
    .bind(to_i64(b.coinbase_amount, "coinbase_amount")?)
    .bind(&b.coinbase_receiver)
    .bind(&b.snarked_ledger_hash)
    .bind(&b.staged_ledger_hash)
    .bind(to_i64(b.epoch, "epoch")?)
    .bind(to_i64(b.slot, "slot")?)
    .bind(to_i64(b.slot_since_genesis, "global_slot_since_genesis")?)
    .bind(to_i64(b.total_currency, "total_currency")?)
    .bind(i64::from(b.num_transactions))
    .bind(i64::from(b.num_fee_transfers))
    .bind(i64::from(b.num_zkapp_transactions))
    .execute(exec)
    .await
    .map_err(|e| db_error("insert block", e))?;

    Ok(result.rows_affected() > 0)
}

async fn insert_transaction_row<'e>(
    exec: impl SqliteExecutor<'e>,
    tx: &Transaction,
) -> Result<bool, MirrorError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO transactions
            (height, block_hash, tx_hash, chain_status, kind, source, receiver, fee_payer,
             token, fee_token, amount, fee, memo, nonce, failure_reason)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(to_i64(tx.height, "height")?)
    .bind(&tx.block_hash)
    .bind(&tx.tx_hash)
    .bind(tx.chain_status.as_str())
    .bind(&tx.kind)
    .bind(&tx.source)
    .bind(&tx.receiver)
    .bind(&tx.fee_payer)
    .bind(&tx.token)
    .bind(&tx.fee_token)
    .bind(to_i64(tx.amount, "amount")?)
    .bind(to_i64(tx.fee, "fee")?)
    .bind(&tx.memo)
    .bind(opt_i64(tx.nonce, "nonce")?)
    .bind(&tx.failure_reason)
    .execute(exec)
    .await
    .map_err(|e| db_error("insert transaction", e))?;

    Ok(result.rows_affected() > 0)
}

async fn insert_fee_transfer_row<'e>(
    exec: impl SqliteExecutor<'e>,
    ft: &FeeTransfer,
) -> Result<bool, MirrorError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO fee_transfers (height, block_hash, chain_status, receiver, amount, kind)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(to_i64(ft.height, "height")?)
    .bind(&ft.block_hash)
    .bind(ft.chain_status.as_str())
    .bind(&ft.receiver)
    .bind(to_i64(ft.amount, "amount")?)
    .bind(&ft.kind)
    .execute(exec)
    .await
    .map_err(|e| db_error("insert fee transfer", e))?;

    Ok(result.rows_affected() > 0)
}

async fn insert_balance_row<'e>(
    exec: impl SqliteExecutor<'e>,
    b: &Balance,
) -> Result<bool, MirrorError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO balances (public_key, height, block_hash, chain_status, total, locked, liquid)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&b.public_key)
    .bind(to_i64(b.height, "height")?)
    .bind(&b.block_hash)
    .bind(b.chain_status.as_str())
    .bind(to_i64(b.total, "total")?)
    .bind(opt_i64(b.locked, "locked")?)
    .bind(opt_i64(b.liquid, "liquid")?)
    .execute(exec)
    .await
    .map_err(|e| db_error("insert balance", e))?;

    Ok(result.rows_affected() > 0)
}

async fn update_status_rows<'e>(
    exec: impl SqliteExecutor<'e>,
    table: &'static str,
    block_hash: &str,
    status: ChainStatus,
) -> Result<u64, MirrorError> {
    let sql = format!(
        "UPDATE {table} SET chain_status = ? WHERE block_hash = ? AND chain_status <> ?"
    );
    let result = sqlx::query(&sql)
        .bind(status.as_str())
        .bind(block_hash)
        .bind(status.as_str())
        .execute(exec)
        .await
        .map_err(|e| db_error("update status", e))?;

    debug!(table, block_hash, %status, rows = result.rows_affected(), "status updated");
    Ok(result.rows_affected())
}

// ─── PersistenceGateway impl ──────────────────────────────────────────────────

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    fn write_mode(&self) -> WriteMode {
        self.mode
    }

    async fn insert_block(&self, block: &Block) -> Result<bool, MirrorError> {
        if self.skip("block", &block.block_hash) {
            return Ok(false);
        }
        insert_block_row(&self.pool, block).await
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, MirrorError> {
        if self.skip("transaction", &tx.tx_hash) {
            return Ok(false);
        }
        insert_transaction_row(&self.pool, tx).await
    }

    async fn insert_fee_transfer(&self, ft: &FeeTransfer) -> Result<bool, MirrorError> {
        if self.skip("fee_transfer", &ft.receiver) {
            return Ok(false);
        }
        insert_fee_transfer_row(&self.pool, ft).await
    }

    async fn insert_balance(&self, balance: &Balance) -> Result<bool, MirrorError> {
        if self.skip("balance", &balance.public_key) {
            return Ok(false);
        }
        insert_balance_row(&self.pool, balance).await
    }

    async fn update_block_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError> {
        if self.skip("block status", block_hash) {
            return Ok(0);
        }
        update_status_rows(&self.pool, "blocks", block_hash, status).await
    }

    async fn update_transaction_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError> {
        if self.skip("transaction status", block_hash) {
            return Ok(0);
        }
        update_status_rows(&self.pool, "transactions", block_hash, status).await
    }

    async fn update_fee_transfer_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError> {
        if self.skip("fee transfer status", block_hash) {
            return Ok(0);
        }
        update_status_rows(&self.pool, "fee_transfers", block_hash, status).await
    }

    async fn update_balance_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError> {
        if self.skip("balance status", block_hash) {
            return Ok(0);
        }
        update_status_rows(&self.pool, "balances", block_hash, status).await
    }

    async fn blocks_at_height(&self, height: u64) -> Result<Vec<StoredBlock>, MirrorError> {
        let rows = sqlx::query(
            "SELECT block_hash, chain_status FROM blocks WHERE height = ? ORDER BY block_hash",
        )
        .bind(to_i64(height, "height")?)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("blocks at height", e))?;

        rows.iter()
            .map(|r| {
                Ok(StoredBlock {
                    block_hash: r.get("block_hash"),
                    chain_status: parse_status(&r.get::<String, _>("chain_status"))?,
                })
            })
            .collect()
    }

    async fn insert_block_set(&self, nb: &NormalizedBlock) -> Result<(), MirrorError> {
        if self.skip("block set", nb.block_hash()) {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(|e| db_error("begin", e))?;

        insert_block_row(&mut *tx, &nb.block).await?;
        for t in &nb.transactions {
            insert_transaction_row(&mut *tx, t).await?;
        }
        for ft in &nb.fee_transfers {
            insert_fee_transfer_row(&mut *tx, ft).await?;
        }
        for b in &nb.balances {
            insert_balance_row(&mut *tx, b).await?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit block set", e))?;
        Ok(())
    }

    async fn cascade_status(&self, block_hash: &str, status: ChainStatus) -> Result<(), MirrorError> {
        if self.skip("status cascade", block_hash) {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(|e| db_error("begin", e))?;
        for table in STATUS_TABLES {
            update_status_rows(&mut *tx, table, block_hash, status).await?;
        }
        tx.commit()
            .await
            .map_err(|e| db_error("commit status cascade", e))?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
