//! Typed schema of a `newBlock` notification as served by the node's GraphQL API.
//!
//! Required fields are plain types, so a payload missing any of them fails at
//! decode time. Optional transaction categories default to empty lists and
//! nullable fields are `Option`. The node encodes 64-bit quantities as decimal
//! strings; both strings and JSON numbers are accepted.

use serde::{Deserialize, Serialize};

/// The `newBlock` object of a block notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlockPayload {
    pub creator_account: AccountRef,
    pub state_hash: String,
    pub protocol_state: ProtocolState,
    pub transactions: BlockTransactions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolState {
    pub previous_state_hash: String,
    pub blockchain_state: BlockchainState,
    pub consensus_state: ConsensusState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainState {
    /// Milliseconds since the Unix epoch, as a string.
    #[serde(with = "quantity")]
    pub date: u64,
    pub snarked_ledger_hash: String,
    pub staged_ledger_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusState {
    #[serde(with = "quantity")]
    pub block_height: u64,
    #[serde(with = "quantity")]
    pub epoch: u64,
    #[serde(with = "quantity")]
    pub slot: u64,
    #[serde(with = "quantity")]
    pub slot_since_genesis: u64,
    #[serde(with = "quantity")]
    pub total_currency: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTransactions {
    #[serde(with = "quantity")]
    pub coinbase: u64,
    pub coinbase_receiver_account: AccountRef,
    #[serde(default)]
    pub user_commands: Vec<UserCommand>,
    #[serde(default)]
    pub fee_transfer: Vec<FeeTransferPayload>,
    /// Only counted; their contents are not mirrored.
    #[serde(default)]
    pub zkapp_commands: Vec<serde_json::Value>,
}

/// An account reference with the balance the node reports for it in this block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRef {
    pub public_key: String,
    pub balance: BalancePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancePayload {
    #[serde(with = "quantity")]
    pub total: u64,
    #[serde(default, with = "opt_quantity")]
    pub locked: Option<u64>,
    #[serde(default, with = "opt_quantity")]
    pub liquid: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCommand {
    pub hash: String,
    pub kind: String,
    pub source: AccountRef,
    pub receiver: AccountRef,
    pub fee_payer: AccountRef,
    #[serde(default, with = "opt_quantity_or_text")]
    pub token: Option<String>,
    #[serde(default, with = "opt_quantity_or_text")]
    pub fee_token: Option<String>,
    #[serde(with = "quantity")]
    pub amount: u64,
    #[serde(with = "quantity")]
    pub fee: u64,
    #[serde(default)]
    pub memo: Option<String>,
    #[serde(default, with = "opt_quantity")]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTransferPayload {
    pub recipient: String,
    #[serde(with = "quantity")]
    pub fee: u64,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

// ─── Quantity codecs ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Number(u64),
    Text(String),
}

impl RawQuantity {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            Self::Number(n) => Ok(n),
            Self::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("expected an unsigned integer, got {s:?}"))),
        }
    }
}

/// `u64` encoded as a decimal string or a JSON number.
mod quantity {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::RawQuantity;

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        RawQuantity::deserialize(d)?.into_u64()
    }
}

mod opt_quantity {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::RawQuantity;

    pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_str(&v.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Option::<RawQuantity>::deserialize(d)?
            .map(RawQuantity::into_u64)
            .transpose()
    }
}

/// Token ids are numbers on older nodes and base58 strings on newer ones.
mod opt_quantity_or_text {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::RawQuantity;

    pub fn serialize<S: Serializer>(v: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(v) => s.serialize_str(v),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<RawQuantity>::deserialize(d)?.map(|q| match q {
            RawQuantity::Number(n) => n.to_string(),
            RawQuantity::Text(s) => s,
        }))
    }
}
