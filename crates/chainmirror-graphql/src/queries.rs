//! GraphQL documents sent to the node and decoding of their answers.

use serde::Deserialize;
use serde_json::Value;

use chainmirror_core::{BestChain, BestChainEntry, MirrorError, SyncStatus};

/// Account fields requested wherever an account appears in a block.
const ACCOUNT_FIELDS: &str = "publicKey balance { total locked liquid }";

/// The `newBlock` subscription. The selection set covers every field the
/// block normalizer reads.
pub fn new_block_subscription() -> String {
    format!(
        "subscription {{
  newBlock {{
    creatorAccount {{ {ACCOUNT_FIELDS} }}
    stateHash
    protocolState {{
      previousStateHash
      blockchainState {{ date snarkedLedgerHash stagedLedgerHash }}
      consensusState {{ blockHeight epoch slot slotSinceGenesis totalCurrency }}
    }}
    transactions {{
      coinbase
      coinbaseReceiverAccount {{ {ACCOUNT_FIELDS} }}
      userCommands {{
        hash kind amount fee memo nonce token feeToken failureReason
        source {{ {ACCOUNT_FIELDS} }}
        receiver {{ {ACCOUNT_FIELDS} }}
        feePayer {{ {ACCOUNT_FIELDS} }}
      }}
      feeTransfer {{ recipient fee type }}
      zkappCommands {{ hash }}
    }}
  }}
}}"
    )
}

/// Trailing `max_length` blocks of the node's best chain.
pub fn best_chain_query(max_length: u32) -> String {
    format!(
        "query {{ bestChain(maxLength: {max_length}) {{ stateHash protocolState {{ consensusState {{ blockHeight }} }} }} }}"
    )
}

pub const SYNC_STATUS_QUERY: &str = "query { syncStatus }";

// ─── Response decoding ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BestChainItem {
    state_hash: String,
    protocol_state: ItemProtocolState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemProtocolState {
    consensus_state: ItemConsensusState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemConsensusState {
    block_height: Value,
}

/// Decode the `data` object of a `bestChain` answer.
///
/// A `null` or missing `bestChain` (node still bootstrapping) is an empty
/// snapshot.
pub fn parse_best_chain(data: &Value) -> Result<BestChain, MirrorError> {
    let items = match data.get("bestChain") {
        None | Some(Value::Null) => return Ok(BestChain::new()),
        Some(items) => items,
    };
    let items: Vec<BestChainItem> = serde_json::from_value(items.clone())
        .map_err(|e| MirrorError::Source(format!("bestChain: unexpected shape: {e}")))?;

    items
        .into_iter()
        .map(|item| {
            let height = quantity(&item.protocol_state.consensus_state.block_height)
                .ok_or_else(|| {
                    MirrorError::Source(format!(
                        "bestChain: bad blockHeight for {}: {}",
                        item.state_hash, item.protocol_state.consensus_state.block_height
                    ))
                })?;
            Ok(BestChainEntry {
                height,
                hash: item.state_hash,
            })
        })
        .collect::<Result<Vec<_>, MirrorError>>()
        .map(BestChain::from_entries)
}

/// Decode the `data` object of a `syncStatus` answer.
pub fn parse_sync_status(data: &Value) -> Result<SyncStatus, MirrorError> {
    let raw = data
        .get("syncStatus")
        .and_then(Value::as_str)
        .ok_or_else(|| MirrorError::Source(format!("syncStatus missing in {data}")))?;
    Ok(raw.parse().unwrap_or_else(|never| match never {}))
}

fn quantity(v: &Value) -> Option<u64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn best_chain_query_embeds_window() {
        let q = best_chain_query(290);
        assert!(q.contains("bestChain(maxLength: 290)"));
        assert!(q.contains("blockHeight"));
    }

    #[test]
    fn subscription_requests_normalizer_fields() {
        let q = new_block_subscription();
        for field in [
            "newBlock",
            "creatorAccount",
            "previousStateHash",
            "slotSinceGenesis",
            "coinbaseReceiverAccount",
            "feePayer",
            "failureReason",
            "feeTransfer { recipient fee type }",
            "zkappCommands",
        ] {
            assert!(q.contains(field), "missing {field}");
        }
    }

    #[test]
    fn parses_best_chain() {
        let data = json!({
            "bestChain": [
                { "stateHash": "3NA", "protocolState": { "consensusState": { "blockHeight": "100" } } },
                { "stateHash": "3NB", "protocolState": { "consensusState": { "blockHeight": 101 } } }
            ]
        });
        let chain = parse_best_chain(&data).unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.canonical_hash(100), Some("3NA"));
        assert_eq!(chain.tip(), Some(101));
    }

    #[test]
    fn null_best_chain_is_empty() {
        assert!(parse_best_chain(&json!({ "bestChain": null })).unwrap().is_empty());
    }

    #[test]
    fn bad_height_is_source_error() {
        let data = json!({
            "bestChain": [
                { "stateHash": "3NA", "protocolState": { "consensusState": { "blockHeight": "tall" } } }
            ]
        });
        assert!(matches!(parse_best_chain(&data), Err(MirrorError::Source(_))));
    }

    #[test]
    fn parses_sync_status() {
        assert_eq!(
            parse_sync_status(&json!({ "syncStatus": "SYNCED" })).unwrap(),
            SyncStatus::Synced
        );
        assert_eq!(
            parse_sync_status(&json!({ "syncStatus": "BOOTSTRAP" })).unwrap(),
            SyncStatus::Bootstrap
        );
        assert!(parse_sync_status(&json!({})).is_err());
    }
}
