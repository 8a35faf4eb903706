//! Block normalizer: turns a `newBlock` notification into entity records.
//!
//! Normalization is all-or-nothing: either every record of the block is
//! produced, or a [`ParseError`] is returned and nothing is.

use chrono::{TimeZone, Utc};
use indexmap::IndexMap;

use crate::error::ParseError;
use crate::payload::{AccountRef, BalancePayload, NewBlockPayload};
use crate::types::{Balance, Block, ChainStatus, FeeTransfer, NormalizedBlock, Transaction};

/// Decode and normalize the raw `newBlock` JSON object.
pub fn normalize_value(raw: serde_json::Value) -> Result<NormalizedBlock, ParseError> {
    let payload: NewBlockPayload = serde_json::from_value(raw)?;
    normalize(&payload)
}

/// Normalize a decoded payload. All records start out [`ChainStatus::Pending`].
pub fn normalize(payload: &NewBlockPayload) -> Result<NormalizedBlock, ParseError> {
    let height = payload.protocol_state.consensus_state.block_height;
    let block_hash = payload.state_hash.clone();
    let txs = &payload.transactions;

    if block_hash.is_empty() {
        return Err(ParseError::InvalidValue {
            field: "stateHash",
            value: block_hash,
        });
    }

    let date = payload.protocol_state.blockchain_state.date;
    let timestamp = i64::try_from(date)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or(ParseError::InvalidValue {
            field: "protocolState.blockchainState.date",
            value: date.to_string(),
        })?;

    let consensus = &payload.protocol_state.consensus_state;
    let blockchain = &payload.protocol_state.blockchain_state;

    let block = Block {
        height,
        block_hash: block_hash.clone(),
        chain_status: ChainStatus::Pending,
        creator: payload.creator_account.public_key.clone(),
        parent_hash: payload.protocol_state.previous_state_hash.clone(),
        timestamp,
        coinbase_amount: txs.coinbase,
        coinbase_receiver: txs.coinbase_receiver_account.public_key.clone(),
        snarked_ledger_hash: blockchain.snarked_ledger_hash.clone(),
        staged_ledger_hash: blockchain.staged_ledger_hash.clone(),
        epoch: consensus.epoch,
        slot: consensus.slot,
        slot_since_genesis: consensus.slot_since_genesis,
        total_currency: consensus.total_currency,
        num_transactions: count(txs.user_commands.len(), "transactions.userCommands")?,
        num_fee_transfers: count(txs.fee_transfer.len(), "transactions.feeTransfer")?,
        num_zkapp_transactions: count(txs.zkapp_commands.len(), "transactions.zkappCommands")?,
    };

    let transactions = txs
        .user_commands
        .iter()
        .map(|cmd| Transaction {
            height,
            block_hash: block_hash.clone(),
            tx_hash: cmd.hash.clone(),
            chain_status: ChainStatus::Pending,
            kind: cmd.kind.clone(),
            source: cmd.source.public_key.clone(),
            receiver: cmd.receiver.public_key.clone(),
            fee_payer: cmd.fee_payer.public_key.clone(),
            token: cmd.token.clone(),
            fee_token: cmd.fee_token.clone(),
            amount: cmd.amount,
            fee: cmd.fee,
            memo: cmd.memo.clone(),
            nonce: cmd.nonce,
            failure_reason: cmd.failure_reason.clone(),
        })
        .collect();

    let fee_transfers = txs
        .fee_transfer
        .iter()
        .map(|ft| FeeTransfer {
            height,
            block_hash: block_hash.clone(),
            chain_status: ChainStatus::Pending,
            receiver: ft.recipient.clone(),
            amount: ft.fee,
            kind: ft.kind.clone(),
        })
        .collect();

    let balances = observed_balances(payload)
        .into_iter()
        .map(|(public_key, b)| Balance {
            public_key,
            height,
            block_hash: block_hash.clone(),
            chain_status: ChainStatus::Pending,
            total: b.total,
            locked: b.locked,
            liquid: b.liquid,
        })
        .collect();

    Ok(NormalizedBlock {
        block,
        transactions,
        fee_transfers,
        balances,
    })
}

/// One balance per distinct public key, last observation wins.
///
/// Observation order: creator, coinbase receiver, then source, receiver and
/// fee payer of every user command in list order. A key keeps the position
/// of its first observation.
fn observed_balances(payload: &NewBlockPayload) -> IndexMap<String, BalancePayload> {
    let txs = &payload.transactions;
    let accounts = [&payload.creator_account, &txs.coinbase_receiver_account]
        .into_iter()
        .chain(
            txs.user_commands
                .iter()
                .flat_map(|cmd| [&cmd.source, &cmd.receiver, &cmd.fee_payer]),
        );

    let mut balances = IndexMap::new();
    for AccountRef { public_key, balance } in accounts {
        balances.insert(public_key.clone(), balance.clone());
    }
    balances
}

fn count(len: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(len).map_err(|_| ParseError::InvalidValue {
        field,
        value: len.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn account(pk: &str, total: u64) -> Value {
        json!({ "publicKey": pk, "balance": { "total": total.to_string() } })
    }

    fn raw_block(height: u64, hash: &str) -> Value {
        json!({
            "creatorAccount": account("B62creator", 1_000),
            "stateHash": hash,
            "protocolState": {
                "previousStateHash": "3Nparent",
                "blockchainState": {
                    "date": "1700000000000",
                    "snarkedLedgerHash": "jxSnarked",
                    "stagedLedgerHash": "jxStaged"
                },
                "consensusState": {
                    "blockHeight": height.to_string(),
                    "epoch": "70",
                    "slot": "1200",
                    "slotSinceGenesis": "150000",
                    "totalCurrency": "1100000000000000000"
                }
            },
            "transactions": {
                "coinbase": "720000000000",
                "coinbaseReceiverAccount": account("B62coinbase", 2_000)
            }
        })
    }

    fn payment(hash: &str, src: (&str, u64), dst: (&str, u64)) -> Value {
        json!({
            "hash": hash,
            "kind": "PAYMENT",
            "source": account(src.0, src.1),
            "receiver": account(dst.0, dst.1),
            "feePayer": account(src.0, src.1),
            "amount": "10",
            "fee": "1",
            "memo": "E4Yf",
            "nonce": 7,
            "failureReason": null
        })
    }

    #[test]
    fn minimal_block_defaults_optional_categories() {
        let nb = normalize_value(raw_block(50, "3NA")).unwrap();
        assert_eq!(nb.block.height, 50);
        assert_eq!(nb.block.block_hash, "3NA");
        assert_eq!(nb.block.chain_status, ChainStatus::Pending);
        assert_eq!(nb.block.num_transactions, 0);
        assert_eq!(nb.block.num_fee_transfers, 0);
        assert_eq!(nb.block.num_zkapp_transactions, 0);
        assert_eq!(nb.block.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(nb.block.total_currency, 1_100_000_000_000_000_000);
        assert!(nb.transactions.is_empty());
        assert!(nb.fee_transfers.is_empty());
        // creator + coinbase receiver
        assert_eq!(nb.balances.len(), 2);
    }

    #[test]
    fn missing_required_field_is_parse_error() {
        let mut raw = raw_block(50, "3NA");
        raw["protocolState"]["consensusState"]
            .as_object_mut()
            .unwrap()
            .remove("blockHeight");
        let err = normalize_value(raw).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
        assert!(err.to_string().contains("blockHeight"));
    }

    #[test]
    fn missing_coinbase_receiver_is_parse_error() {
        let mut raw = raw_block(50, "3NA");
        raw["transactions"]
            .as_object_mut()
            .unwrap()
            .remove("coinbaseReceiverAccount");
        assert!(normalize_value(raw).is_err());
    }

    #[test]
    fn incomplete_user_command_drops_whole_block() {
        let mut raw = raw_block(50, "3NA");
        let mut cmd = payment("CkpA", ("B62pk1", 90), ("B62pk2", 10));
        cmd.as_object_mut().unwrap().remove("feePayer");
        raw["transactions"]["userCommands"] = json!([cmd]);
        assert!(normalize_value(raw).is_err());
    }

    #[test]
    fn non_numeric_height_is_parse_error() {
        let mut raw = raw_block(50, "3NA");
        raw["protocolState"]["consensusState"]["blockHeight"] = json!("fifty");
        assert!(normalize_value(raw).is_err());
    }

    #[test]
    fn counts_and_children() {
        let mut raw = raw_block(51, "3NB");
        raw["transactions"]["userCommands"] = json!([
            payment("CkpA", ("B62pk1", 90), ("B62pk2", 10)),
            payment("CkpB", ("B62pk3", 5), ("B62pk4", 20)),
        ]);
        raw["transactions"]["feeTransfer"] = json!([
            { "recipient": "B62snark", "fee": "1", "type": "Fee_transfer" }
        ]);
        raw["transactions"]["zkappCommands"] = json!([{ "hash": "5Jz" }]);

        let nb = normalize_value(raw).unwrap();
        assert_eq!(nb.block.num_transactions, 2);
        assert_eq!(nb.block.num_fee_transfers, 1);
        assert_eq!(nb.block.num_zkapp_transactions, 1);

        let tx = &nb.transactions[0];
        assert_eq!(tx.tx_hash, "CkpA");
        assert_eq!(tx.block_hash, "3NB");
        assert_eq!(tx.height, 51);
        assert_eq!(tx.amount, 10);
        assert_eq!(tx.nonce, Some(7));
        assert_eq!(tx.memo.as_deref(), Some("E4Yf"));
        assert!(tx.failure_reason.is_none());

        let ft = &nb.fee_transfers[0];
        assert_eq!(ft.receiver, "B62snark");
        assert_eq!(ft.amount, 1);
        assert_eq!(ft.kind.as_deref(), Some("Fee_transfer"));
    }

    #[test]
    fn balances_deduplicated_last_seen_wins() {
        let mut raw = raw_block(52, "3NC");
        raw["transactions"]["userCommands"] = json!([
            payment("CkpA", ("B62pk1", 90), ("B62pk2", 10)),
            payment("CkpB", ("B62pk1", 70), ("B62creator", 1_020)),
        ]);

        let nb = normalize_value(raw).unwrap();
        let keys: Vec<_> = nb.balances.iter().map(|b| b.public_key.as_str()).collect();
        assert_eq!(keys, ["B62creator", "B62coinbase", "B62pk1", "B62pk2"]);

        let find = |pk: &str| nb.balances.iter().find(|b| b.public_key == pk).unwrap();
        assert_eq!(find("B62pk1").total, 70);
        assert_eq!(find("B62creator").total, 1_020);
        assert!(nb.balances.iter().all(|b| b.block_hash == "3NC" && b.height == 52));
    }
}
