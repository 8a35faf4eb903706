//! Reconciler: re-derives the status of stored blocks from a best-chain snapshot.
//!
//! A sweep walks every height of the snapshot, reads the blocks stored at
//! that height, and cascades a new status onto each block whose stored
//! status disagrees with the snapshot. Running a sweep twice with the same
//! snapshot changes nothing the second time.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MirrorError;
use crate::gateway::PersistenceGateway;
use crate::resolver::BestChain;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::types::{ChainStatus, StoredBlock};

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Heights inspected.
    pub heights: usize,
    /// Blocks moved to [`ChainStatus::Canonical`].
    pub promoted: usize,
    /// Blocks moved to [`ChainStatus::Orphaned`].
    pub demoted: usize,
    /// Heights whose read or update still failed after retries.
    pub failed: Vec<u64>,
    /// The first of those failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
}

impl SweepReport {
    pub fn changed(&self) -> usize {
        self.promoted + self.demoted
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// The fatal error for an unclean sweep, `None` when every height succeeded.
    pub fn to_error(&self) -> Option<MirrorError> {
        if self.is_clean() {
            return None;
        }
        Some(MirrorError::Storage(format!(
            "reconciliation failed at height(s) {:?}: {}",
            self.failed,
            self.first_error.as_deref().unwrap_or("unknown error")
        )))
    }
}

/// Applies best-chain snapshots to stored blocks.
pub struct Reconciler {
    gateway: Arc<dyn PersistenceGateway>,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, retry: RetryPolicy) -> Self {
        Self { gateway, retry }
    }

    /// Reconcile every height of `chain`.
    ///
    /// Each store call is retried under the retry policy. A height that still
    /// fails is logged and recorded in the report, and the remaining heights
    /// are processed anyway; callers treat an unclean report as fatal.
    /// Flips applied before a failure at the same height are still counted.
    ///
    /// Returns [`MirrorError::Aborted`] only when `cancel` fires.
    pub async fn sweep(
        &self,
        chain: &BestChain,
        cancel: &CancellationToken,
    ) -> Result<SweepReport, MirrorError> {
        let mut report = SweepReport {
            heights: chain.len(),
            ..Default::default()
        };

        for (height, canonical) in chain.iter() {
            match self.reconcile_height(height, canonical, cancel, &mut report).await {
                Ok(()) => {}
                Err(e) if e.is_aborted() => return Err(e),
                Err(e) => {
                    warn!(height, error = %e, "Reconciliation failed at height, skipping");
                    report.failed.push(height);
                    report.first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if report.changed() > 0 || !report.is_clean() {
            info!(
                heights = report.heights,
                promoted = report.promoted,
                demoted = report.demoted,
                failed = report.failed.len(),
                "Reconciliation sweep complete"
            );
        } else {
            debug!(heights = report.heights, "Reconciliation sweep: nothing to change");
        }
        Ok(report)
    }

    async fn reconcile_height(
        &self,
        height: u64,
        canonical: &str,
        cancel: &CancellationToken,
        report: &mut SweepReport,
    ) -> Result<(), MirrorError> {
        let gateway = &self.gateway;
        let stored = retry_with_backoff(&self.retry, cancel, "read blocks at height", || {
            gateway.blocks_at_height(height)
        })
        .await?;

        for StoredBlock {
            block_hash,
            chain_status,
        } in stored
        {
            let target = if block_hash == canonical {
                ChainStatus::Canonical
            } else {
                ChainStatus::Orphaned
            };
            if chain_status == target {
                continue;
            }

            retry_with_backoff(&self.retry, cancel, "cascade status", || {
                gateway.cascade_status(&block_hash, target)
            })
            .await?;
            info!(
                height,
                block_hash = %block_hash,
                from = %chain_status,
                to = %target,
                "Chain status changed"
            );
            match target {
                ChainStatus::Canonical => report.promoted += 1,
                _ => report.demoted += 1,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FailingGateway;
    use crate::gateway::{MemoryGateway, WriteMode};
    use crate::normalizer::normalize_value;
    use crate::retry::RetryConfig;
    use crate::types::NormalizedBlock;
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
                }]
            }
        }))
        .unwrap()
    }

    fn chain(pairs: &[(u64, &str)]) -> BestChain {
        pairs.iter().map(|(h, s)| (*h, s.to_string())).collect()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: Some(3),
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        })
    }

    fn reconciler(gw: Arc<dyn PersistenceGateway>) -> Reconciler {
        Reconciler::new(gw, fast_retry())
    }

    async fn sweep(reconciler: &Reconciler, snapshot: &BestChain) -> SweepReport {
        reconciler
            .sweep(snapshot, &CancellationToken::new())
            .await
            .unwrap()
    }

    async fn store(gw: &MemoryGateway, height: u64, hash: &str, status: ChainStatus) {
        gw.insert_block_set(&sample(height, hash).with_status(status))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn orphans_sibling_and_converges() {
        let gw = Arc::new(MemoryGateway::new(WriteMode::Live));
        store(&gw, 100, "H1", ChainStatus::Canonical).await;
        store(&gw, 100, "Hx", ChainStatus::Pending).await;

        let reconciler = reconciler(gw.clone());
        let snapshot = chain(&[(100, "H1")]);

        let first = sweep(&reconciler, &snapshot).await;
        assert_eq!(first.promoted, 0);
        assert_eq!(first.demoted, 1);
        assert_eq!(gw.block(100, "H1").unwrap().chain_status, ChainStatus::Canonical);
        assert_eq!(gw.block(100, "Hx").unwrap().chain_status, ChainStatus::Orphaned);

        let updates = gw.status_updates();
        let second = sweep(&reconciler, &snapshot).await;
        assert_eq!(second.changed(), 0);
        assert_eq!(gw.status_updates(), updates);
    }

    #[tokio::test]
    async fn reorg_flips_and_cascades() {
        let gw = Arc::new(MemoryGateway::new(WriteMode::Live));
        store(&gw, 100, "A", ChainStatus::Canonical).await;
        store(&gw, 100, "B", ChainStatus::Orphaned).await;

        let report = sweep(&reconciler(gw.clone()), &chain(&[(100, "B")])).await;
        assert_eq!(report.promoted, 1);
        assert_eq!(report.demoted, 1);

        assert!(gw.transactions_of("A").iter().all(|t| t.chain_status == ChainStatus::Orphaned));
        assert!(gw.balances_of("A").iter().all(|b| b.chain_status == ChainStatus::Orphaned));
        assert!(gw.transactions_of("B").iter().all(|t| t.chain_status == ChainStatus::Canonical));
        assert!(gw.balances_of("B").iter().all(|b| b.chain_status == ChainStatus::Canonical));
    }

    #[tokio::test]
    async fn pending_block_promoted_once_height_enters_window() {
        let gw = Arc::new(MemoryGateway::new(WriteMode::Live));
        store(&gw, 101, "C", ChainStatus::Pending).await;

        let reconciler = reconciler(gw.clone());
        let report = sweep(&reconciler, &chain(&[(100, "A")])).await;
        assert_eq!(report.changed(), 0);
        assert_eq!(gw.block(101, "C").unwrap().chain_status, ChainStatus::Pending);

        let report = sweep(&reconciler, &chain(&[(100, "A"), (101, "C")])).await;
        assert_eq!(report.promoted, 1);
        assert_eq!(gw.block(101, "C").unwrap().chain_status, ChainStatus::Canonical);
    }

    #[tokio::test]
    async fn empty_snapshot_is_a_no_op() {
        let gw = Arc::new(MemoryGateway::new(WriteMode::Live));
        store(&gw, 100, "A", ChainStatus::Pending).await;
        let report = sweep(&reconciler(gw.clone()), &BestChain::new()).await;
        assert_eq!(report, SweepReport::default());
        assert!(report.to_error().is_none());
    }

    #[tokio::test]
    async fn transient_read_failure_is_retried() {
        let gw = Arc::new(FailingGateway::reads_at(100, Some(1)));
        gw.insert_block_set(&sample(100, "A")).await.unwrap();

        let report = sweep(&reconciler(gw.clone()), &chain(&[(100, "A")])).await;
        assert!(report.is_clean());
        assert_eq!(report.promoted, 1);
        assert_eq!(gw.inner.block(100, "A").unwrap().chain_status, ChainStatus::Canonical);
    }

    #[tokio::test]
    async fn transient_update_failure_is_retried() {
        let gw = Arc::new(FailingGateway::updates_of("A", Some(2)));
        gw.insert_block_set(&sample(100, "A")).await.unwrap();

        let report = sweep(&reconciler(gw.clone()), &chain(&[(100, "A")])).await;
        assert!(report.is_clean());
        assert_eq!(gw.inner.block(100, "A").unwrap().chain_status, ChainStatus::Canonical);
    }

    #[tokio::test]
    async fn persistent_failure_is_isolated_and_reported() {
        let gw = Arc::new(FailingGateway::reads_at(100, None));
        gw.insert_block_set(&sample(100, "A")).await.unwrap();
        gw.insert_block_set(&sample(101, "B")).await.unwrap();

        let report = sweep(&reconciler(gw.clone()), &chain(&[(100, "A"), (101, "B")])).await;
        assert_eq!(report.failed, vec![100]);
        assert_eq!(report.promoted, 1);
        assert_eq!(gw.inner.block(100, "A").unwrap().chain_status, ChainStatus::Pending);
        assert_eq!(gw.inner.block(101, "B").unwrap().chain_status, ChainStatus::Canonical);

        let err = report.to_error().unwrap();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("[100]"));
    }

    #[tokio::test]
    async fn exhausted_retries_are_reported() {
        let gw = Arc::new(FailingGateway::reads_at(100, Some(10)));
        gw.insert_block_set(&sample(100, "A")).await.unwrap();

        let report = sweep(&reconciler(gw.clone()), &chain(&[(100, "A")])).await;
        assert_eq!(report.failed, vec![100]);
        assert_eq!(report.first_error.as_deref(), Some("Transient storage error: connection reset"));
    }

    #[tokio::test]
    async fn flips_before_a_failure_at_the_same_height_are_counted() {
        // "A" sorts before "B", so "A" is promoted before "B" fails.
        let gw = Arc::new(FailingGateway::updates_of("B", None));
        gw.insert_block_set(&sample(100, "A")).await.unwrap();
        gw.insert_block_set(&sample(100, "B")).await.unwrap();

        let report = sweep(&reconciler(gw.clone()), &chain(&[(100, "A")])).await;
        assert_eq!(report.promoted, 1);
        assert_eq!(report.demoted, 0);
        assert_eq!(report.failed, vec![100]);
        assert_eq!(gw.inner.block(100, "A").unwrap().chain_status, ChainStatus::Canonical);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_sweep() {
        let gw = Arc::new(FailingGateway::reads_at(100, Some(10)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reconciler(gw)
            .sweep(&chain(&[(100, "A")]), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
    }
}
