//! chainmirror-core: block ingestion and chain-reorganization reconciliation.
//!
//! # Architecture
//!
//! ```text
//! ChainSource ──envelopes──► IngestLoop
//!                               ├── normalizer   (newBlock payload → records)
//!                               ├── BestChain    (status of (height, hash))
//!                               ├── PersistenceGateway (idempotent inserts)
//!                               └── Reconciler   (sweep the window, flip statuses)
//! ```
//!
//! Storage backends live in `chainmirror-storage`, the Mina GraphQL source in
//! `chainmirror-graphql`. [`MemoryGateway`] and [`MemorySource`] are
//! in-process stand-ins for both.

pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod normalizer;
pub mod payload;
pub mod reconcile;
pub mod resolver;
pub mod retry;
pub mod source;
pub mod sync;
pub mod types;

pub use config::{
    DatabaseConfig, GraphqlConfig, LogConfig, MirrorConfig, SyncConfig, DEFAULT_WINDOW,
};
pub use error::{MirrorError, ParseError};
pub use gateway::{MemoryGateway, PersistenceGateway, RowCounts, WriteMode};
pub use ingest::{IngestLoop, IngestState, IngestStats, IngestedBlock};
pub use normalizer::{normalize, normalize_value};
pub use reconcile::{Reconciler, SweepReport};
pub use resolver::{BestChain, BestChainEntry};
pub use retry::{retry_with_backoff, RetryConfig, RetryPolicy};
pub use source::{ChainSource, Envelope, EnvelopeStream, MemorySource, Notification, SyncStatus};
pub use sync::wait_for_sync;
pub use types::{
    Balance, Block, ChainStatus, FeeTransfer, NormalizedBlock, StoredBlock, Transaction,
};
