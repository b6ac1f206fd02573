//! Evoplan CLI - resolve Evo2 training options into a run plan
//!
//! Provides the `evoplan` command: validate a flat option set, derive the
//! batch size, architecture, run identity and training policies, and print
//! the result for a human or as JSON for a launcher.

mod commands;
mod config;
mod flags;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, shells};
use colored::Colorize;
use evoplan_core::PlanError;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{catalog, identity, resolve, CatalogArgs, ResolveArgs};

/// Evoplan - run-plan resolution for Evo2 training
#[derive(Parser, Debug)]
#[command(
    name = "evoplan",
    author,
    version,
    about = "Resolve Evo2 training options into a run plan",
    long_about = "Evoplan validates training options, derives the global batch size and model architecture,\nnames the run deterministically and decides how checkpoints are resumed."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve options into a full run plan
    ///
    /// Options are layered: config `[defaults]`, then `--options <FILE>`,
    /// then command-line flags.
    Resolve(Box<ResolveArgs>),

    /// Print only the run identity for a set of options
    Identity(Box<ResolveArgs>),

    /// List the model size identifiers known to the catalog
    Catalog(CatalogArgs),
}

fn main() {
    if let Err(err) = run() {
        report(&err);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    // Handle completion generation
    if let Ok(shell) = std::env::var("EVOPLAN_GENERATE_COMPLETIONS") {
        let mut cmd = Args::command();
        match shell.as_str() {
            "bash" => generate(shells::Bash, &mut cmd, "evoplan", &mut std::io::stdout()),
            "zsh" => generate(shells::Zsh, &mut cmd, "evoplan", &mut std::io::stdout()),
            "fish" => generate(shells::Fish, &mut cmd, "evoplan", &mut std::io::stdout()),
            "powershell" => generate(shells::PowerShell, &mut cmd, "evoplan", &mut std::io::stdout()),
            "elvish" => generate(shells::Elvish, &mut cmd, "evoplan", &mut std::io::stdout()),
            _ => anyhow::bail!("Unknown shell: {}. Supported: bash, zsh, fish, powershell, elvish", shell),
        }
        return Ok(());
    }

    let args = Args::parse();
    let cli_config = config::load_config()?;

    // Flag, then config file, then warn. Logs go to stderr so JSON on stdout stays clean.
    let level_name = args.log_level.as_deref().or(cli_config.log_level.as_deref()).unwrap_or("warn");
    let level = match level_name {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    match command {
        Command::Resolve(args) => resolve::execute(*args, &cli_config),
        Command::Identity(args) => identity::execute(*args, &cli_config),
        Command::Catalog(args) => catalog::execute(&args, &cli_config),
    }
}

/// Print a failure. Resolution errors carry their kind and offending options.
fn report(err: &anyhow::Error) {
    if let Some(plan_err) = err.downcast_ref::<PlanError>() {
        eprintln!("{} {}", format!("error[{}]:", plan_err.kind()).red().bold(), plan_err);
        let options = plan_err.options();
        if !options.is_empty() {
            eprintln!("  {} {}", "options:".dimmed(), options.join(", "));
        }
    } else {
        eprintln!("{} {:#}", "error:".red().bold(), err);
    }
}
