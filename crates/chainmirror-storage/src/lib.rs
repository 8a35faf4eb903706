//! chainmirror-storage: SQL persistence gateways for ChainMirror.
//!
//! Backends:
//! - `postgres`: PostgreSQL via `sqlx` (production, default feature)
//! - `sqlite`: SQLite via `sqlx` (embedded, single-file or in-memory)
//!
//! Both create the `blocks`, `transactions`, `fee_transfers` and `balances`
//! tables on connect and implement [`PersistenceGateway`] with one
//! transaction per block insert set and per status cascade.
//! [`connect`] picks a backend from the database URL.

use std::sync::Arc;

use chainmirror_core::{DatabaseConfig, MemoryGateway, MirrorError, PersistenceGateway, WriteMode};

#[cfg(any(feature = "postgres", feature = "sqlite"))]
mod error;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub use error::is_transient;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresGateway, PostgresOptions};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteGateway;

/// Open the gateway named by `config.url`.
///
/// - `postgres://` / `postgresql://` → [`PostgresGateway`] (feature `postgres`)
/// - `sqlite:` → [`SqliteGateway`] (feature `sqlite`)
/// - `memory:` → [`MemoryGateway`]
pub async fn connect(
    config: &DatabaseConfig,
    mode: WriteMode,
) -> Result<Arc<dyn PersistenceGateway>, MirrorError> {
    let url = config.url.as_str();

    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        #[cfg(feature = "postgres")]
        {
            let gateway =
                PostgresGateway::connect_with_options(url, PostgresOptions::from(config), mode)
                    .await?;
            return Ok(Arc::new(gateway));
        }
        #[cfg(not(feature = "postgres"))]
        return Err(MirrorError::Config(
            "PostgreSQL support not compiled in (enable the `postgres` feature)".into(),
        ));
    }

    if url.starts_with("sqlite:") {
        #[cfg(feature = "sqlite")]
        {
            let gateway = SqliteGateway::open(url, mode).await?;
            return Ok(Arc::new(gateway));
        }
        #[cfg(not(feature = "sqlite"))]
        return Err(MirrorError::Config(
            "SQLite support not compiled in (enable the `sqlite` feature)".into(),
        ));
    }

    if url.starts_with("memory:") {
        tracing::warn!("Using the in-memory gateway; nothing survives a restart");
        return Ok(Arc::new(MemoryGateway::new(mode)));
    }

    Err(MirrorError::Config(format!(
        "unsupported database url scheme: {url}"
    )))
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub(crate) fn to_i64(value: u64, field: &'static str) -> Result<i64, MirrorError> {
    i64::try_from(value)
        .map_err(|_| MirrorError::Storage(format!("{field} out of range for BIGINT: {value}")))
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub(crate) fn opt_i64(value: Option<u64>, field: &'static str) -> Result<Option<i64>, MirrorError> {
    value.map(|v| to_i64(v, field)).transpose()
}

#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub(crate) fn parse_status(raw: &str) -> Result<chainmirror_core::ChainStatus, MirrorError> {
    raw.parse().map_err(MirrorError::Storage)
}
