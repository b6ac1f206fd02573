//! CLI configuration loading and option layering.

use anyhow::{Context, Result};
use evoplan_core::{load_options_file, EvoplanConfig, RawOptions};
use std::path::Path;

/// Load and merge CLI configuration.
///
/// Configuration precedence:
/// 1. CLI arguments (handled by clap)
/// 2. Local config file (./.evoplanrc)
/// 3. Global config file (~/.evoplan/config.toml)
/// 4. Defaults
pub fn load_config() -> Result<EvoplanConfig> {
    EvoplanConfig::discover_and_load().context("Failed to load evoplan configuration")
}

/// Build the raw option set: config defaults, then the options file, then flags.
pub fn layer_options(config: &EvoplanConfig, options_file: Option<&Path>, flags: RawOptions) -> Result<RawOptions> {
    let mut raw = config.default_options().context("Invalid [defaults] in configuration")?;

    if let Some(path) = options_file {
        let from_file = load_options_file(path)
            .with_context(|| format!("Failed to load options file {}", path.display()))?;
        raw.merge(from_file);
    }

    raw.merge(flags);
    Ok(raw)
}
