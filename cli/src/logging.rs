//! Tracing initialisation.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainmirror_core::LogConfig;

/// Install the global subscriber. `RUST_LOG`, when set and valid, replaces the
/// configured directives.
pub fn init_tracing(config: &LogConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives(config, verbose)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn directives(config: &LogConfig, verbose: bool) -> String {
    let mut directives = config.directives();
    if verbose {
        directives.push_str(",chainmirror_core=debug,chainmirror_storage=debug,chainmirror_graphql=debug");
    }
    directives
}
