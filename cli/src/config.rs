//! Loading `MirrorConfig` from a YAML file plus command-line overrides.

use std::path::Path;

use anyhow::{Context, Result};

use chainmirror_core::{MirrorConfig, WriteMode};

/// Overrides taken from the command line. `None` keeps the file's value.
#[derive(Debug, Default)]
pub struct Overrides {
    pub database_url: Option<String>,
    pub dry_run: bool,
    pub window: Option<u32>,
}

pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<MirrorConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            parse(&raw).with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => MirrorConfig::default(),
    };

    if let Some(url) = overrides.database_url {
        config.database.url = url;
    }
    if overrides.dry_run {
        config.mode = WriteMode::DryRun;
    }
    if let Some(window) = overrides.window {
        config.window = window;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn parse(raw: &str) -> Result<MirrorConfig> {
    if raw.trim().is_empty() {
        return Ok(MirrorConfig::default());
    }
    Ok(serde_yaml::from_str(raw)?)
}
