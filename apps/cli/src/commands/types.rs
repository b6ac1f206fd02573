//! Command argument types shared between main.rs and the command modules.

use crate::flags::OptionFlags;
use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct ResolveArgs {
    /// TOML file of options, layered over config defaults and under flags
    #[arg(long = "options", value_name = "FILE")]
    pub options_file: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub flags: OptionFlags,
}

impl ResolveArgs {
    pub fn wants_json(&self, config: &evoplan_core::EvoplanConfig) -> bool {
        self.json || config.output.wants_json()
    }
}

#[derive(Args, Debug, Clone)]
pub struct CatalogArgs {
    /// Only list sizes of this family (hyena, mamba)
    #[arg(long)]
    pub family: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}
