//! Event source seam: the node the mirror listens to.
//!
//! A [`ChainSource`] delivers a stream of [`Envelope`]s (one per frame of the
//! node's subscription) and answers two queries: the trailing window of the
//! best chain, and the node's sync status.

use std::collections::VecDeque;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{stream, Stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MirrorError;
use crate::resolver::BestChain;

/// Stream of envelopes produced by [`ChainSource::subscribe`].
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<Envelope, MirrorError>> + Send>>;

/// Something that produces block notifications and answers best-chain queries.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Open the block subscription. The stream ends when the connection closes.
    async fn subscribe(&self) -> Result<EnvelopeStream, MirrorError>;

    /// The node's current best chain, at most `window` trailing heights.
    async fn best_chain(&self, window: u32) -> Result<BestChain, MirrorError>;

    async fn sync_status(&self) -> Result<SyncStatus, MirrorError>;
}

// ─── SyncStatus ───────────────────────────────────────────────────────────────

/// Sync state reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Connecting,
    Listening,
    Offline,
    Bootstrap,
    Synced,
    Catchup,
    /// A value this crate does not know, kept verbatim.
    Unknown(String),
}

impl SyncStatus {
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Listening => "LISTENING",
            Self::Offline => "OFFLINE",
            Self::Bootstrap => "BOOTSTRAP",
            Self::Synced => "SYNCED",
            Self::Catchup => "CATCHUP",
            Self::Unknown(s) => s,
        }
    }
}

impl FromStr for SyncStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECTING" => Self::Connecting,
            "LISTENING" => Self::Listening,
            "OFFLINE" => Self::Offline,
            "BOOTSTRAP" => Self::Bootstrap,
            "SYNCED" => Self::Synced,
            "CATCHUP" => Self::Catchup,
            other => Self::Unknown(other.to_string()),
        })
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// One frame received from the subscription transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// What an [`Envelope`] means to the ingestion loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A `newBlock` payload, still raw.
    NewBlock(Value),
    /// A reorganization advisory; informational only.
    Reorganization(Value),
    /// Keep-alives, acks and anything unrecognized.
    Ignored,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            id: None,
        }
    }

    /// Parse a raw text frame.
    pub fn from_text(text: &str) -> Result<Self, MirrorError> {
        serde_json::from_str(text)
            .map_err(|e| MirrorError::Source(format!("undecodable frame: {e}")))
    }

    /// Classify this envelope. Consumes it so the block payload is not copied.
    ///
    /// Only `data` envelopes carry notifications; every other type is ignored
    /// whatever its payload.
    pub fn classify(self) -> Notification {
        if self.kind != "data" {
            return Notification::Ignored;
        }
        let Value::Object(mut payload) = self.payload else {
            return Notification::Ignored;
        };

        if let Some(advisory) = payload.remove("ChainReorganization") {
            return Notification::Reorganization(advisory);
        }

        let Some(Value::Object(mut data)) = payload.remove("data") else {
            return Notification::Ignored;
        };
        if let Some(advisory) = data.remove("chainReorganization") {
            return Notification::Reorganization(advisory);
        }
        match data.remove("newBlock") {
            Some(block) if !block.is_null() => Notification::NewBlock(block),
            _ => Notification::Ignored,
        }
    }
}

// ─── In-memory source (for testing and replay) ────────────────────────────────

/// A [`ChainSource`] fed by hand.
///
/// Each call to `subscribe` consumes one queued session; once the queue is
/// empty the returned stream never yields. The best chain and sync status are
/// whatever was last set.
pub struct MemorySource {
    sessions: Mutex<VecDeque<Vec<Envelope>>>,
    best_chain: Mutex<BestChain>,
    sync_status: Mutex<SyncStatus>,
    subscriptions: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self {
            sessions: Mutex::default(),
            best_chain: Mutex::default(),
            sync_status: Mutex::new(SyncStatus::Synced),
            subscriptions: AtomicUsize::new(0),
        }
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the envelopes delivered by the next subscription.
    pub fn push_session(&self, envelopes: Vec<Envelope>) {
        lock(&self.sessions).push_back(envelopes);
    }

    pub fn set_best_chain(&self, chain: BestChain) {
        *lock(&self.best_chain) = chain;
    }

    pub fn set_sync_status(&self, status: SyncStatus) {
        *lock(&self.sync_status) = status;
    }

    /// Number of times `subscribe` was called.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ChainSource for MemorySource {
    async fn subscribe(&self) -> Result<EnvelopeStream, MirrorError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.sessions).pop_front();
        match next {
            Some(envelopes) => Ok(Box::pin(stream::iter(
                envelopes.into_iter().map(Ok::<_, MirrorError>),
            ))),
            None => Ok(Box::pin(stream::pending::<Result<Envelope, MirrorError>>())),
        }
    }

    async fn best_chain(&self, window: u32) -> Result<BestChain, MirrorError> {
        let chain = lock(&self.best_chain);
        let Some(tip) = chain.tip() else {
            return Ok(BestChain::new());
        };
        let floor = tip.saturating_sub(u64::from(window).saturating_sub(1));
        Ok(chain
            .iter()
            .filter(|(height, _)| *height >= floor)
            .map(|(height, hash)| (height, hash.to_string()))
            .collect())
    }

    async fn sync_status(&self) -> Result<SyncStatus, MirrorError> {
        Ok(lock(&self.sync_status).clone())
    }
}
