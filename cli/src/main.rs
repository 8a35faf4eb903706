//! ChainMirror CLI: mirror a Mina node's blocks into a relational store.
//!
//! # Commands
//! ```bash
//! chainmirror run         --config chainmirror.yaml
//! chainmirror reconcile   --config chainmirror.yaml [--json]
//! chainmirror sync-status --config chainmirror.yaml
//! chainmirror info
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use chainmirror_core::{
    retry_with_backoff, ChainSource, IngestLoop, MirrorConfig, Reconciler, DEFAULT_WINDOW,
};
use chainmirror_graphql::MinaGraphqlSource;

mod config;
mod logging;

#[derive(Parser)]
#[command(
    name = "chainmirror",
    about = "Mirror Mina blocks into PostgreSQL or SQLite and keep their chain status current",
    long_about = "
ChainMirror subscribes to a Mina node's GraphQL endpoint, stores every block
it announces together with its transactions, fee transfers and balances, and
re-derives the canonical/orphaned/pending status of the trailing window of
heights after each block.

Without --config every setting takes its default (local node on port 3085,
local PostgreSQL database `mina`). RUST_LOG overrides the configured log level.
",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override `database.url` (postgresql://…, sqlite:…, memory:)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Read from the store but never write to it
    #[arg(long, global = true)]
    dry_run: bool,

    /// Override the reconciliation window
    #[arg(long, global = true)]
    window: Option<u32>,

    /// Debug logging for the chainmirror crates
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for the node to sync, then ingest blocks until Ctrl-C
    Run,

    /// Run a single reconciliation sweep against the node's current best chain
    Reconcile {
        /// Print the sweep report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the node's sync status
    #[command(name = "sync-status")]
    SyncStatus,

    /// Show build info and the default configuration
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Info = cli.command {
        return cmd_info();
    }

    let config = config::load(
        cli.config.as_deref(),
        config::Overrides {
            database_url: cli.database_url,
            dry_run: cli.dry_run,
            window: cli.window,
        },
    )?;
    logging::init_tracing(&config.log, cli.verbose);

    match cli.command {
        Commands::Run => cmd_run(&config).await,
        Commands::Reconcile { json } => cmd_reconcile(&config, json).await,
        Commands::SyncStatus => cmd_sync_status(&config).await,
        Commands::Info => cmd_info(),
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run(config: &MirrorConfig) -> Result<()> {
    let gateway = chainmirror_storage::connect(&config.database, config.mode)
        .await
        .context("opening the store")?;
    let source = Arc::new(
        MinaGraphqlSource::from_config(&config.graphql).context("building the node client")?,
    );

    tracing::info!(
        node = source.ws_url(),
        mode = ?config.mode,
        window = config.window,
        "Starting chainmirror"
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut ingest = IngestLoop::new(source, gateway, config);
    let stats = ingest.run(cancel).await.context("ingestion stopped")?;

    tracing::info!(
        blocks = stats.blocks_ingested,
        parse_failures = stats.parse_failures,
        promoted = stats.promoted,
        demoted = stats.demoted,
        sweep_failures = stats.sweep_failures,
        "Stopped"
    );
    Ok(())
}

async fn cmd_reconcile(config: &MirrorConfig, as_json: bool) -> Result<()> {
    let gateway = chainmirror_storage::connect(&config.database, config.mode)
        .await
        .context("opening the store")?;
    let source =
        MinaGraphqlSource::from_config(&config.graphql).context("building the node client")?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let window = config.window;
    let chain = retry_with_backoff(&config.store_retry_policy(), &cancel, "fetch best chain", || {
        source.best_chain(window)
    })
    .await
    .context("fetching the best chain")?;

    let report = Reconciler::new(gateway, config.store_retry_policy())
        .sweep(&chain, &cancel)
        .await
        .context("reconciling")?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Heights:  {}", report.heights);
        if let (Some(floor), Some(tip)) = (chain.floor(), chain.tip()) {
            println!("Range:    {floor}..={tip}");
        }
        println!("Promoted: {}", report.promoted);
        println!("Demoted:  {}", report.demoted);
        println!("Failed:   {:?}", report.failed);
    }

    if let Some(e) = report.to_error() {
        return Err(e).context(format!("{} height(s) could not be reconciled", report.failed.len()));
    }
    Ok(())
}

async fn cmd_sync_status(config: &MirrorConfig) -> Result<()> {
    let source =
        MinaGraphqlSource::from_config(&config.graphql).context("building the node client")?;
    let status = source
        .sync_status()
        .await
        .with_context(|| format!("querying {}", source.http_url()))?;
    println!("{status}");
    Ok(())
}

fn cmd_info() -> Result<()> {
    println!("ChainMirror v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default reconciliation window: {DEFAULT_WINDOW} heights");
    println!("  Stores: PostgreSQL (postgresql://), SQLite (sqlite:), in-memory (memory:)");
    println!("  Node transport: GraphQL over HTTP + graphql-ws subscription");
    println!();
    println!("Default configuration:");
    print!("{}", serde_yaml::to_string(&MirrorConfig::default())?);
    Ok(())
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Ctrl-C received, shutting down");
                cancel.cancel();
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
}
