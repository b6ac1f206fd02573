//! Catalog command implementation.

use super::types::CatalogArgs;
use anyhow::{anyhow, Result};
use colored::Colorize;
use evoplan_core::{ArchitectureFamily, Catalog, CatalogEntry, EvoplanConfig};
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Size")]
    size: &'static str,
    #[tabled(rename = "Family")]
    family: &'static str,
    #[tabled(rename = "Layers")]
    layers: u32,
    #[tabled(rename = "Hidden")]
    hidden: u32,
    #[tabled(rename = "Heads")]
    heads: u32,
    #[tabled(rename = "Seq length")]
    seq_length: u32,
}

impl From<&CatalogEntry> for EntryRow {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            size: entry.size,
            family: entry.family.as_str(),
            layers: entry.defaults.num_layers,
            hidden: entry.defaults.hidden_size,
            heads: entry.defaults.num_attention_heads,
            seq_length: entry.defaults.seq_length,
        }
    }
}

/// Execute the catalog command.
pub fn execute(args: &CatalogArgs, config: &EvoplanConfig) -> Result<()> {
    let family = args
        .family
        .as_deref()
        .map(str::parse::<ArchitectureFamily>)
        .transpose()
        .map_err(|e| anyhow!(e))?;

    let catalog = Catalog::builtin();
    let entries: Vec<&CatalogEntry> =
        catalog.entries().iter().filter(|entry| family.is_none_or(|f| entry.family == f)).collect();

    if args.json || config.output.wants_json() {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Model Catalog ({})", entries.len()).bold().cyan());
    println!();
    let rows: Vec<EntryRow> = entries.into_iter().map(EntryRow::from).collect();
    println!("{}", Table::new(rows).with(Style::rounded()).to_string());
    println!();
    Ok(())
}
