//! Startup wait until the node reports `SYNCED`.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::MirrorError;
use crate::source::{ChainSource, SyncStatus};

/// Poll [`ChainSource::sync_status`] until it returns [`SyncStatus::Synced`].
///
/// Between polls the delay grows per `config`. Query failures count as
/// "not synced yet". Returns [`MirrorError::Aborted`] when `cancel` fires, and
/// [`MirrorError::Source`] when `max_attempts` polls all came back unsynced.
pub async fn wait_for_sync(
    source: &dyn ChainSource,
    config: &SyncConfig,
    cancel: &CancellationToken,
) -> Result<SyncStatus, MirrorError> {
    let policy = config.policy();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(MirrorError::Aborted {
                reason: "cancelled while waiting for node sync".into(),
            });
        }

        let last = match source.sync_status().await {
            Ok(status) if status.is_synced() => {
                info!(attempts = attempt + 1, "Node is synced");
                return Ok(status);
            }
            Ok(status) => status.to_string(),
            Err(e) => {
                warn!(error = %e, "Sync status query failed");
                format!("error: {e}")
            }
        };

        attempt += 1;
        let Some(delay) = policy.next_delay(attempt) else {
            return Err(MirrorError::Source(format!(
                "node not synced after {attempt} attempts (last: {last})"
            )));
        };
        info!(status = %last, attempt, ?delay, "Waiting for node to sync");

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(MirrorError::Aborted {
                    reason: "cancelled while waiting for node sync".into(),
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
