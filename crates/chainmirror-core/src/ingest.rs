//! The ingestion loop: consumes block notifications one at a time.
//!
//! # Per block
//! 1. Normalize the `newBlock` payload into records
//! 2. Fetch the best chain (trailing `window` heights)
//! 3. Resolve the block's status against it and stamp every record
//! 4. Insert the block and its children
//! 5. Sweep the window, flipping stored blocks whose status changed
//!
//! Steps run strictly in that order and a block is finished before the next
//! envelope is read. Store calls, best-chain fetches and sweep reads and
//! updates go through the retry policy. A payload that fails to normalize is
//! logged and skipped; a store failure that survives the retries, including
//! one inside the sweep, stops ingestion.

use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MirrorConfig, SyncConfig};
use crate::error::MirrorError;
use crate::gateway::PersistenceGateway;
use crate::normalizer::normalize_value;
use crate::reconcile::{Reconciler, SweepReport};
use crate::retry::{retry_with_backoff, RetryConfig, RetryPolicy};
use crate::source::{ChainSource, Envelope, EnvelopeStream, Notification};
use crate::sync::wait_for_sync;
use crate::types::ChainStatus;

/// Runtime state of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IngestState {
    /// Waiting for the next envelope.
    Idle,
    /// Waiting for the node to report `SYNCED`.
    WaitingForSync,
    /// Handling one envelope.
    ProcessingEvent,
    /// Terminated, either cancelled or after a fatal error.
    Stopped,
}

impl std::fmt::Display for IngestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::WaitingForSync => write!(f, "waiting-for-sync"),
            Self::ProcessingEvent => write!(f, "processing-event"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counters kept by the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub blocks_ingested: u64,
    pub parse_failures: u64,
    pub reorg_advisories: u64,
    pub ignored_envelopes: u64,
    pub promoted: u64,
    pub demoted: u64,
    /// Heights a sweep could not reconcile; any such height stops ingestion.
    pub sweep_failures: u64,
    pub subscriptions: u64,
}

/// Result of ingesting one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedBlock {
    pub height: u64,
    pub block_hash: String,
    /// Status assigned at insert time.
    pub status: ChainStatus,
    pub sweep: SweepReport,
}

/// Drives normalization, resolution, persistence and reconciliation.
pub struct IngestLoop {
    source: Arc<dyn ChainSource>,
    gateway: Arc<dyn PersistenceGateway>,
    reconciler: Reconciler,
    window: u32,
    store_retry: RetryPolicy,
    sync: SyncConfig,
    resubscribe: RetryPolicy,
    state: IngestState,
    stats: IngestStats,
}

impl IngestLoop {
    pub fn new(
        source: Arc<dyn ChainSource>,
        gateway: Arc<dyn PersistenceGateway>,
        config: &MirrorConfig,
    ) -> Self {
        // Re-subscribing never gives up; it backs off like the sync wait.
        let resubscribe = RetryPolicy::new(RetryConfig {
            max_retries: None,
            initial_backoff_ms: config.sync.initial_delay_ms,
            max_backoff_ms: config.sync.max_delay_ms,
            multiplier: config.sync.multiplier,
        });
        Self {
            reconciler: Reconciler::new(gateway.clone(), config.store_retry_policy()),
            source,
            gateway,
            window: config.window,
            store_retry: config.store_retry_policy(),
            sync: config.sync.clone(),
            resubscribe,
            state: IngestState::Idle,
            stats: IngestStats::default(),
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Wait for sync, then consume the subscription until `cancel` fires.
    ///
    /// Returns the final counters on cancellation, or the fatal error that
    /// stopped ingestion.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<IngestStats, MirrorError> {
        let result = self.run_inner(&cancel).await;
        self.state = IngestState::Stopped;
        match result {
            Ok(()) => {
                info!(
                    blocks = self.stats.blocks_ingested,
                    parse_failures = self.stats.parse_failures,
                    "Ingestion stopped"
                );
                Ok(self.stats.clone())
            }
            Err(e) if e.is_aborted() => {
                info!(reason = %e, "Ingestion cancelled");
                Ok(self.stats.clone())
            }
            Err(e) => {
                error!(error = %e, "Ingestion stopped on fatal error");
                Err(e)
            }
        }
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<(), MirrorError> {
        self.state = IngestState::WaitingForSync;
        wait_for_sync(self.source.as_ref(), &self.sync, cancel).await?;
        self.state = IngestState::Idle;

        let mut failures = 0u32;
        while !cancel.is_cancelled() {
            let stream = match self.source.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, attempt = failures, "Subscription failed");
                    self.pause(failures, cancel).await?;
                    continue;
                }
            };
            self.stats.subscriptions += 1;
            info!(window = self.window, "Subscribed to new blocks");

            let delivered = self.consume(stream, cancel).await?;
            if cancel.is_cancelled() {
                break;
            }
            if delivered > 0 {
                failures = 0;
            }
            failures += 1;
            warn!(delivered, "Subscription ended, re-subscribing");
            self.pause(failures, cancel).await?;
        }
        Ok(())
    }

    /// Read envelopes until the stream ends, errors, or `cancel` fires.
    /// Returns the number of envelopes handled.
    async fn consume(
        &mut self,
        mut stream: EnvelopeStream,
        cancel: &CancellationToken,
    ) -> Result<u64, MirrorError> {
        let mut delivered = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(delivered),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(envelope)) => {
                    delivered += 1;
                    self.handle_envelope(envelope, cancel).await?;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Subscription stream error");
                    return Ok(delivered);
                }
                None => return Ok(delivered),
            }
        }
    }

    async fn pause(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), MirrorError> {
        let delay = self
            .resubscribe
            .next_delay(attempt)
            .unwrap_or(std::time::Duration::from_millis(self.sync.max_delay_ms));
        tokio::select! {
            _ = cancel.cancelled() => Err(MirrorError::Aborted {
                reason: "cancelled while re-subscribing".into(),
            }),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Handle one envelope.
    ///
    /// Parse failures are counted and swallowed; any other error is fatal.
    pub async fn handle_envelope(
        &mut self,
        envelope: Envelope,
        cancel: &CancellationToken,
    ) -> Result<(), MirrorError> {
        self.state = IngestState::ProcessingEvent;
        let kind = envelope.kind.clone();
        let result = match envelope.classify() {
            Notification::NewBlock(raw) => match self.process_block(raw, cancel).await {
                Ok(_) => Ok(()),
                Err(MirrorError::Parse(e)) => {
                    self.stats.parse_failures += 1;
                    warn!(error = %e, "Dropping malformed block");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Notification::Reorganization(advisory) => {
                self.stats.reorg_advisories += 1;
                info!(%advisory, "Chain reorganization reported by node");
                Ok(())
            }
            Notification::Ignored => {
                self.stats.ignored_envelopes += 1;
                debug!(kind = %kind, "Ignoring envelope");
                Ok(())
            }
        };
        self.state = IngestState::Idle;
        result
    }

    /// Normalize, resolve, persist and reconcile one raw `newBlock` payload.
    pub async fn process_block(
        &mut self,
        raw: Value,
        cancel: &CancellationToken,
    ) -> Result<IngestedBlock, MirrorError> {
        let normalized = normalize_value(raw)?;
        let height = normalized.height();

        let source = &self.source;
        let window = self.window;
        let chain = retry_with_backoff(&self.store_retry, cancel, "fetch best chain", || {
            source.best_chain(window)
        })
        .await?;

        let status = chain.resolve(height, normalized.block_hash());
        let block = normalized.with_status(status);

        let gateway = &self.gateway;
        retry_with_backoff(&self.store_retry, cancel, "insert block set", || {
            gateway.insert_block_set(&block)
        })
        .await?;

        info!(
            height,
            hash = %block.block_hash(),
            status = %status,
            transactions = block.transactions.len(),
            fee_transfers = block.fee_transfers.len(),
            balances = block.balances.len(),
            "Block ingested"
        );

        self.stats.blocks_ingested += 1;

        let sweep = self.reconciler.sweep(&chain, cancel).await?;
        self.stats.promoted += sweep.promoted as u64;
        self.stats.demoted += sweep.demoted as u64;
        if let Some(e) = sweep.to_error() {
            self.stats.sweep_failures += sweep.failed.len() as u64;
            return Err(e);
        }

        Ok(IngestedBlock {
            height,
            block_hash: block.block.block_hash,
            status,
            sweep,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FailingGateway;
    use crate::gateway::{MemoryGateway, WriteMode};
    use crate::resolver::BestChain;
    use crate::source::MemorySource;
    use serde_json::json;
    use std::time::Duration;

    fn raw_block(height: u64, hash: &str) -> Value {
        let account = |pk: &str| json!({ "publicKey": pk, "balance": { "total": "5" } });
        json!({
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
                "coinbaseReceiverAccount": account("B62coinbase")
            }
        })
    }

    fn block_envelope(height: u64, hash: &str) -> Envelope {
        Envelope::new("data", json!({ "data": { "newBlock": raw_block(height, hash) } }))
    }

    fn chain(pairs: &[(u64, &str)]) -> BestChain {
        pairs.iter().map(|(h, s)| (*h, s.to_string())).collect()
    }

    fn fast_config() -> MirrorConfig {
        let mut config = MirrorConfig::default();
        config.sync.initial_delay_ms = 1;
        config.sync.max_delay_ms = 5;
        config.store_retry.initial_backoff_ms = 1;
        config.store_retry.max_backoff_ms = 5;
        config
    }

    fn setup() -> (Arc<MemorySource>, Arc<MemoryGateway>, IngestLoop) {
        let source = Arc::new(MemorySource::new());
        let gateway = Arc::new(MemoryGateway::new(WriteMode::Live));
        let ingest = IngestLoop::new(source.clone(), gateway.clone(), &fast_config());
        (source, gateway, ingest)
    }

    #[tokio::test]
    async fn block_resolved_against_fresh_snapshot() {
        let (source, gateway, mut ingest) = setup();
        let cancel = CancellationToken::new();
        source.set_best_chain(chain(&[(49, "Z"), (50, "A")]));

        let out = ingest.process_block(raw_block(50, "A"), &cancel).await.unwrap();
        assert_eq!(out.status, ChainStatus::Canonical);

        let out = ingest.process_block(raw_block(51, "C"), &cancel).await.unwrap();
        assert_eq!(out.status, ChainStatus::Pending);

        let out = ingest.process_block(raw_block(50, "B"), &cancel).await.unwrap();
        assert_eq!(out.status, ChainStatus::Orphaned);
        assert_eq!(gateway.row_counts().blocks, 3);
        assert_eq!(ingest.stats().blocks_ingested, 3);
    }

    #[tokio::test]
    async fn sweep_after_insert_promotes_earlier_pending_block() {
        let (source, gateway, mut ingest) = setup();
        let cancel = CancellationToken::new();

        ingest.process_block(raw_block(50, "A"), &cancel).await.unwrap();
        assert_eq!(gateway.block(50, "A").unwrap().chain_status, ChainStatus::Pending);

        source.set_best_chain(chain(&[(50, "A"), (51, "B")]));
        let out = ingest.process_block(raw_block(51, "B"), &cancel).await.unwrap();
        assert_eq!(out.sweep.promoted, 1);
        assert_eq!(gateway.block(50, "A").unwrap().chain_status, ChainStatus::Canonical);
    }

    #[tokio::test]
    async fn envelopes_are_dispatched_by_kind() {
        let (_source, gateway, mut ingest) = setup();
        let cancel = CancellationToken::new();

        for env in [
            Envelope::new("connection_ack", Value::Null),
            Envelope::new("ka", Value::Null),
            Envelope::new("data", json!({ "ChainReorganization": { "height": 5 } })),
            Envelope::new("data", json!({ "data": { "newBlock": { "stateHash": "3Nbad" } } })),
            block_envelope(50, "A"),
        ] {
            ingest.handle_envelope(env, &cancel).await.unwrap();
        }

        let stats = ingest.stats();
        assert_eq!(stats.ignored_envelopes, 2);
        assert_eq!(stats.reorg_advisories, 1);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.blocks_ingested, 1);
        assert_eq!(gateway.row_counts().blocks, 1);
        assert_eq!(ingest.state(), IngestState::Idle);
    }

    #[tokio::test]
    async fn sweep_retries_transient_store_errors() {
        let source = Arc::new(MemorySource::new());
        let gateway = Arc::new(FailingGateway::reads_at(50, Some(1)));
        let mut ingest = IngestLoop::new(source.clone(), gateway.clone(), &fast_config());
        source.set_best_chain(chain(&[(50, "A")]));
        gateway.insert_block_set(&normalize_value(raw_block(50, "A")).unwrap()).await.unwrap();

        let out = ingest
            .process_block(raw_block(51, "B"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.sweep.is_clean());
        assert_eq!(out.sweep.promoted, 1);
        assert_eq!(gateway.inner.block(50, "A").unwrap().chain_status, ChainStatus::Canonical);
    }

    #[tokio::test]
    async fn persistent_sweep_failure_stops_ingestion() {
        let source = Arc::new(MemorySource::new());
        let gateway = Arc::new(FailingGateway::reads_at(50, None));
        let mut ingest = IngestLoop::new(source.clone(), gateway.clone(), &fast_config());
        source.set_best_chain(chain(&[(50, "A"), (51, "B")]));
        source.push_session(vec![block_envelope(51, "B")]);

        let err = ingest.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MirrorError::Storage(ref m) if m.contains("[50]")));
        assert_eq!(ingest.state(), IngestState::Stopped);
        assert_eq!(ingest.stats().blocks_ingested, 1);
        assert_eq!(ingest.stats().sweep_failures, 1);
        // the other height of the window was still reconciled
        assert_eq!(gateway.inner.block(51, "B").unwrap().chain_status, ChainStatus::Canonical);
    }

    #[tokio::test]
    async fn run_resubscribes_and_stops_on_cancel() {
        let (source, gateway, mut ingest) = setup();
        source.set_best_chain(chain(&[(50, "A"), (51, "B")]));
        source.push_session(vec![block_envelope(50, "A")]);
        source.push_session(vec![block_envelope(51, "B")]);

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let stats = ingest.run(cancel).await;
                (stats, ingest.state())
            })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while gateway.row_counts().blocks < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let (stats, state) = handle.await.unwrap();
        let stats = stats.unwrap();
        assert_eq!(stats.blocks_ingested, 2);
        assert!(stats.subscriptions >= 2);
        assert_eq!(state, IngestState::Stopped);
        assert_eq!(gateway.block(51, "B").unwrap().chain_status, ChainStatus::Canonical);
    }
}
