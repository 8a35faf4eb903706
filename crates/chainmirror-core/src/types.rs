//! Entity model: the rows mirrored into the relational store.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── ChainStatus ──────────────────────────────────────────────────────────────

/// Where a block stands relative to the node's best chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainStatus {
    /// Height not (yet) inside the best-chain window.
    Pending,
    /// The block is the best chain's block at its height.
    Canonical,
    /// Another block holds the best chain's slot at this height.
    Orphaned,
}

impl ChainStatus {
    /// Storage representation (`"pending"`, `"canonical"`, `"orphaned"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Canonical => "canonical",
            Self::Orphaned => "orphaned",
        }
    }
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "canonical" => Ok(Self::Canonical),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(format!("unknown chain status: {other}")),
        }
    }
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A mirrored block. Identity is `(height, block_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub block_hash: String,
    pub chain_status: ChainStatus,
    /// Public key of the block producer.
    pub creator: String,
    pub parent_hash: String,
    pub timestamp: DateTime<Utc>,
    /// Coinbase reward in nanomina.
    pub coinbase_amount: u64,
    pub coinbase_receiver: String,
    pub snarked_ledger_hash: String,
    pub staged_ledger_hash: String,
    pub epoch: u64,
    pub slot: u64,
    pub slot_since_genesis: u64,
    pub total_currency: u64,
    pub num_transactions: u32,
    pub num_fee_transfers: u32,
    pub num_zkapp_transactions: u32,
}

// ─── Transaction ──────────────────────────────────────────────────────────────

/// A user command included in a block. Identity is `(block_hash, tx_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub height: u64,
    pub block_hash: String,
    pub tx_hash: String,
    /// Copy of the owning block's status.
    pub chain_status: ChainStatus,
    /// `PAYMENT`, `STAKE_DELEGATION`, ...
    pub kind: String,
    pub source: String,
    pub receiver: String,
    pub fee_payer: String,
    pub token: Option<String>,
    pub fee_token: Option<String>,
    pub amount: u64,
    pub fee: u64,
    pub memo: Option<String>,
    pub nonce: Option<u64>,
    pub failure_reason: Option<String>,
}

// ─── FeeTransfer ──────────────────────────────────────────────────────────────

/// A fee transfer included in a block.
///
/// There is no transaction hash; `(block_hash, receiver, amount)` is used as
/// a best-effort natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTransfer {
    pub height: u64,
    pub block_hash: String,
    pub chain_status: ChainStatus,
    pub receiver: String,
    pub amount: u64,
    /// `Fee_transfer` or `Fee_transfer_via_coinbase`, when the node reports it.
    pub kind: Option<String>,
}

impl FeeTransfer {
    /// Natural key used for duplicate suppression.
    pub fn key(&self) -> (&str, &str, u64) {
        (&self.block_hash, &self.receiver, self.amount)
    }
}

// ─── Balance ──────────────────────────────────────────────────────────────────

/// Balance of one account as observed in one block. Identity is `(public_key, block_hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub public_key: String,
    pub height: u64,
    pub block_hash: String,
    pub chain_status: ChainStatus,
    pub total: u64,
    pub locked: Option<u64>,
    pub liquid: Option<u64>,
}

// ─── NormalizedBlock ──────────────────────────────────────────────────────────

/// One block and every child row derived from its notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedBlock {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub fee_transfers: Vec<FeeTransfer>,
    pub balances: Vec<Balance>,
}

impl NormalizedBlock {
    pub fn height(&self) -> u64 {
        self.block.height
    }

    pub fn block_hash(&self) -> &str {
        &self.block.block_hash
    }

    /// Stamp `status` on the block and all of its children.
    pub fn with_status(mut self, status: ChainStatus) -> Self {
        self.block.chain_status = status;
        for tx in &mut self.transactions {
            tx.chain_status = status;
        }
        for ft in &mut self.fee_transfers {
            ft.chain_status = status;
        }
        for bal in &mut self.balances {
            bal.chain_status = status;
        }
        self
    }
}

// ─── StoredBlock ──────────────────────────────────────────────────────────────

/// The slice of a stored block the reconciler needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub block_hash: String,
    pub chain_status: ChainStatus,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
