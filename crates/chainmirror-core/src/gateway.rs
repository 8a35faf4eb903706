//! Persistence gateway: idempotent writes and status updates against the store.
//!
//! Every insert is a no-op when a row with the same natural key exists, so a
//! redelivered notification never produces duplicate rows. Status updates
//! address all rows of one `block_hash`.
//!
//! Implementations: [`MemoryGateway`] here, `PostgresGateway` and
//! `SqliteGateway` in `chainmirror-storage`.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MirrorError;
use crate::types::{
    Balance, Block, ChainStatus, FeeTransfer, NormalizedBlock, StoredBlock, Transaction,
};

// ─── WriteMode ────────────────────────────────────────────────────────────────

/// Whether a gateway executes writes. Fixed when the gateway is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    /// Inserts and updates are executed.
    #[default]
    #[serde(alias = "nominal")]
    Live,
    /// Inserts and updates are logged and skipped; reads still run.
    #[serde(alias = "debug", alias = "dry_run")]
    DryRun,
}

impl WriteMode {
    pub fn writes_enabled(&self) -> bool {
        matches!(self, Self::Live)
    }
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::DryRun => write!(f, "dry-run"),
        }
    }
}

// ─── PersistenceGateway ───────────────────────────────────────────────────────

/// Store operations used by the ingestion loop and the reconciler.
///
/// Inserts return `true` when a new row was written. Status updates return
/// the number of rows changed.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    fn write_mode(&self) -> WriteMode;

    async fn insert_block(&self, block: &Block) -> Result<bool, MirrorError>;

    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, MirrorError>;

    async fn insert_fee_transfer(&self, ft: &FeeTransfer) -> Result<bool, MirrorError>;

    async fn insert_balance(&self, balance: &Balance) -> Result<bool, MirrorError>;

    async fn update_block_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError>;

    async fn update_transaction_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError>;

    async fn update_fee_transfer_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError>;

    async fn update_balance_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError>;

    /// All stored blocks at `height` (several when forks were observed).
    async fn blocks_at_height(&self, height: u64) -> Result<Vec<StoredBlock>, MirrorError>;

    /// Insert a block and all of its children.
    ///
    /// SQL backends override this to run inside one transaction.
    async fn insert_block_set(&self, nb: &NormalizedBlock) -> Result<(), MirrorError> {
        self.insert_block(&nb.block).await?;
        for tx in &nb.transactions {
            self.insert_transaction(tx).await?;
        }
        for ft in &nb.fee_transfers {
            self.insert_fee_transfer(ft).await?;
        }
        for balance in &nb.balances {
            self.insert_balance(balance).await?;
        }
        Ok(())
    }

    /// Set `status` on a block and every child row that references it.
    ///
    /// SQL backends override this to run inside one transaction.
    async fn cascade_status(&self, block_hash: &str, status: ChainStatus) -> Result<(), MirrorError> {
        self.update_block_status(block_hash, status).await?;
        self.update_transaction_status(block_hash, status).await?;
        self.update_fee_transfer_status(block_hash, status).await?;
        self.update_balance_status(block_hash, status).await?;
        Ok(())
    }
}

// ─── In-memory gateway (for testing and dry runs) ─────────────────────────────

#[derive(Default)]
struct Tables {
    blocks: BTreeMap<(u64, String), Block>,
    transactions: BTreeMap<(String, String), Transaction>,
    fee_transfers: BTreeMap<(String, String, u64), FeeTransfer>,
    balances: BTreeMap<(String, String), Balance>,
    status_updates: u64,
}

/// Row counts of a [`MemoryGateway`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub blocks: usize,
    pub transactions: usize,
    pub fee_transfers: usize,
    pub balances: usize,
}

/// In-memory gateway with the same natural-key semantics as the SQL schema.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryGateway {
    mode: WriteMode,
    tables: Mutex<Tables>,
}

impl MemoryGateway {
    pub fn new(mode: WriteMode) -> Self {
        Self {
            mode,
            tables: Mutex::default(),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn skip(&self, what: &str, key: &str) -> bool {
        if self.mode.writes_enabled() {
            return false;
        }
        debug!(what, key, mode = %self.mode, "write skipped");
        true
    }

    pub fn row_counts(&self) -> RowCounts {
        let t = self.tables();
        RowCounts {
            blocks: t.blocks.len(),
            transactions: t.transactions.len(),
            fee_transfers: t.fee_transfers.len(),
            balances: t.balances.len(),
        }
    }

    /// Number of status-update statements that changed at least one row.
    pub fn status_updates(&self) -> u64 {
        self.tables().status_updates
    }

    pub fn block(&self, height: u64, block_hash: &str) -> Option<Block> {
        self.tables()
            .blocks
            .get(&(height, block_hash.to_string()))
            .cloned()
    }

    pub fn transactions_of(&self, block_hash: &str) -> Vec<Transaction> {
        self.tables()
            .transactions
            .values()
            .filter(|t| t.block_hash == block_hash)
            .cloned()
            .collect()
    }

    pub fn fee_transfers_of(&self, block_hash: &str) -> Vec<FeeTransfer> {
        self.tables()
            .fee_transfers
            .values()
            .filter(|f| f.block_hash == block_hash)
            .cloned()
            .collect()
    }

    pub fn balances_of(&self, block_hash: &str) -> Vec<Balance> {
        self.tables()
            .balances
            .values()
            .filter(|b| b.block_hash == block_hash)
            .cloned()
            .collect()
    }

    /// Every balance row recorded for `public_key`, one per observing block.
    pub fn balance_history(&self, public_key: &str) -> Vec<Balance> {
        self.tables()
            .balances
            .values()
            .filter(|b| b.public_key == public_key)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    fn write_mode(&self) -> WriteMode {
        self.mode
    }

    async fn insert_block(&self, block: &Block) -> Result<bool, MirrorError> {
        if self.skip("block", &block.block_hash) {
            return Ok(false);
        }
        let key = (block.height, block.block_hash.clone());
        let mut t = self.tables();
        if t.blocks.contains_key(&key) {
            return Ok(false);
        }
        t.blocks.insert(key, block.clone());
        Ok(true)
    }

    async fn insert_transaction(&self, tx: &Transaction) -> Result<bool, MirrorError> {
        if self.skip("transaction", &tx.tx_hash) {
            return Ok(false);
        }
        let key = (tx.block_hash.clone(), tx.tx_hash.clone());
        let mut t = self.tables();
        if t.transactions.contains_key(&key) {
            return Ok(false);
        }
        t.transactions.insert(key, tx.clone());
        Ok(true)
    }

    async fn insert_fee_transfer(&self, ft: &FeeTransfer) -> Result<bool, MirrorError> {
        if self.skip("fee_transfer", &ft.receiver) {
            return Ok(false);
        }
        let key = (ft.block_hash.clone(), ft.receiver.clone(), ft.amount);
        let mut t = self.tables();
        if t.fee_transfers.contains_key(&key) {
            return Ok(false);
        }
        t.fee_transfers.insert(key, ft.clone());
        Ok(true)
    }

    async fn insert_balance(&self, balance: &Balance) -> Result<bool, MirrorError> {
        if self.skip("balance", &balance.public_key) {
            return Ok(false);
        }
        let key = (balance.public_key.clone(), balance.block_hash.clone());
        let mut t = self.tables();
        if t.balances.contains_key(&key) {
            return Ok(false);
        }
        t.balances.insert(key, balance.clone());
        Ok(true)
    }

    async fn update_block_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError> {
        if self.skip("block status", block_hash) {
            return Ok(0);
        }
        let mut t = self.tables();
        let mut changed = 0;
        for row in t
            .blocks
            .values_mut()
            .filter(|r| r.block_hash == block_hash && r.chain_status != status)
        {
            row.chain_status = status;
            changed += 1;
        }
        if changed > 0 {
            t.status_updates += 1;
        }
        Ok(changed)
    }

    async fn update_transaction_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError> {
        if self.skip("transaction status", block_hash) {
            return Ok(0);
        }
        let mut t = self.tables();
        let mut changed = 0;
        for row in t
            .transactions
            .values_mut()
            .filter(|r| r.block_hash == block_hash && r.chain_status != status)
        {
            row.chain_status = status;
            changed += 1;
        }
        if changed > 0 {
            t.status_updates += 1;
        }
        Ok(changed)
    }

    async fn update_fee_transfer_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError> {
        if self.skip("fee transfer status", block_hash) {
            return Ok(0);
        }
        let mut t = self.tables();
        let mut changed = 0;
        for row in t
            .fee_transfers
            .values_mut()
            .filter(|r| r.block_hash == block_hash && r.chain_status != status)
        {
            row.chain_status = status;
            changed += 1;
        }
        if changed > 0 {
            t.status_updates += 1;
        }
        Ok(changed)
    }

    async fn update_balance_status(
        &self,
        block_hash: &str,
        status: ChainStatus,
    ) -> Result<u64, MirrorError> {
        if self.skip("balance status", block_hash) {
            return Ok(0);
        }
        let mut t = self.tables();
        let mut changed = 0;
        for row in t
            .balances
            .values_mut()
            .filter(|r| r.block_hash == block_hash && r.chain_status != status)
        {
            row.chain_status = status;
            changed += 1;
        }
        if changed > 0 {
            t.status_updates += 1;
        }
        Ok(changed)
    }

    async fn blocks_at_height(&self, height: u64) -> Result<Vec<StoredBlock>, MirrorError> {
        Ok(self
            .tables()
            .blocks
            .range((height, String::new())..)
            .take_while(|((h, _), _)| *h == height)
            .map(|(_, b)| StoredBlock {
                block_hash: b.block_hash.clone(),
                chain_status: b.chain_status,
            })
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::normalize_value;
    use serde_json::json;

    fn sample(height: u64, hash: &str) -> NormalizedBlock {
        let account = |pk: &str| json!({ "publicKey": pk, "balance": { "total": "5" } });
        normalize_value(json!({
            "creatorAccount": account("B62creator"),
            "stateHash": hash,
            "protocolState": {
                "previousStateHash": "3Nparent",
                "blockchainState": { "date": "1700000000000", "snarkedLedgerHash": "s", "stagedLedgerHash": "t" },
                "consensusState": {
                    "blockHeight": height.to_string(), "epoch": "1", "slot": "2",
                    "slotSinceGenesis": "3", "totalCurrency": "4"
                }
            },
            "transactions": {
                "coinbase": "720",
                "coinbaseReceiverAccount": account("B62coinbase"),
                "userCommands": [{
                    "hash": format!("Ckp{hash}"), "kind": "PAYMENT",
                    "source": account("B62pk1"), "receiver": account("B62pk2"), "feePayer": account("B62pk1"),
                    "amount": "10", "fee": "1"
                }],
                "feeTransfer": [{ "recipient": "B62snark", "fee": "2" }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn write_mode_aliases() {
        let live: WriteMode = serde_json::from_str("\"nominal\"").unwrap();
        let dry: WriteMode = serde_json::from_str("\"debug\"").unwrap();
        let dry2: WriteMode = serde_json::from_str("\"dry-run\"").unwrap();
        assert_eq!(live, WriteMode::Live);
        assert_eq!(dry, WriteMode::DryRun);
        assert_eq!(dry2, WriteMode::DryRun);
        assert_eq!(WriteMode::default(), WriteMode::Live);
    }

    #[tokio::test]
    async fn insert_block_set_is_idempotent() {
        let gw = MemoryGateway::new(WriteMode::Live);
        let nb = sample(50, "3NA");
        gw.insert_block_set(&nb).await.unwrap();
        gw.insert_block_set(&nb).await.unwrap();

        let counts = gw.row_counts();
        assert_eq!(counts.blocks, 1);
        assert_eq!(counts.transactions, 1);
        assert_eq!(counts.fee_transfers, 1);
        // creator, coinbase receiver, pk1, pk2
        assert_eq!(counts.balances, 4);
        assert!(!gw.insert_block(&nb.block).await.unwrap());
    }

    #[tokio::test]
    async fn forks_share_a_height() {
        let gw = MemoryGateway::new(WriteMode::Live);
        gw.insert_block_set(&sample(50, "3NA")).await.unwrap();
        gw.insert_block_set(&sample(50, "3NB")).await.unwrap();
        gw.insert_block_set(&sample(51, "3NC")).await.unwrap();

        let at_50 = gw.blocks_at_height(50).await.unwrap();
        let hashes: Vec<_> = at_50.iter().map(|b| b.block_hash.as_str()).collect();
        assert_eq!(hashes, ["3NA", "3NB"]);
        assert!(gw.blocks_at_height(49).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cascade_updates_every_table() {
        let gw = MemoryGateway::new(WriteMode::Live);
        gw.insert_block_set(&sample(50, "3NA")).await.unwrap();
        gw.insert_block_set(&sample(50, "3NB")).await.unwrap();

        gw.cascade_status("3NA", ChainStatus::Canonical).await.unwrap();

        assert_eq!(gw.block(50, "3NA").unwrap().chain_status, ChainStatus::Canonical);
        assert!(gw.transactions_of("3NA").iter().all(|t| t.chain_status == ChainStatus::Canonical));
        assert!(gw.fee_transfers_of("3NA").iter().all(|f| f.chain_status == ChainStatus::Canonical));
        assert!(gw.balances_of("3NA").iter().all(|b| b.chain_status == ChainStatus::Canonical));
        // untouched sibling
        assert_eq!(gw.block(50, "3NB").unwrap().chain_status, ChainStatus::Pending);
        assert!(gw.balances_of("3NB").iter().all(|b| b.chain_status == ChainStatus::Pending));
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let gw = MemoryGateway::new(WriteMode::DryRun);
        let nb = sample(50, "3NA");
        gw.insert_block_set(&nb).await.unwrap();
        gw.cascade_status("3NA", ChainStatus::Orphaned).await.unwrap();

        assert_eq!(gw.row_counts(), RowCounts::default());
        assert_eq!(gw.status_updates(), 0);
        assert!(gw.blocks_at_height(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn balance_history_spans_blocks() {
        let gw = MemoryGateway::new(WriteMode::Live);
        gw.insert_block_set(&sample(50, "3NA")).await.unwrap();
        gw.insert_block_set(&sample(51, "3NB")).await.unwrap();
        assert_eq!(gw.balance_history("B62pk1").len(), 2);
    }
}
