//! Resolve command implementation.

use super::types::ResolveArgs;
use crate::config::layer_options;
use anyhow::Result;
use colored::Colorize;
use evoplan_core::{EvoplanConfig, PlanResolver, Policy, ResumeState, RunPlan};
use tracing::debug;

/// Layer the option sources and resolve them against the local filesystem.
pub fn plan_for(args: ResolveArgs, config: &EvoplanConfig) -> Result<RunPlan> {
    let raw = layer_options(config, args.options_file.as_deref(), args.flags.into_raw())?;
    debug!(options = raw.len(), "layered options");
    Ok(PlanResolver::new().resolve(raw)?)
}

/// Execute the resolve command.
pub fn execute(args: ResolveArgs, config: &EvoplanConfig) -> Result<()> {
    let json = args.wants_json(config);
    let plan = plan_for(args, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        display_plan(&plan);
    }
    Ok(())
}

fn display_plan(plan: &RunPlan) {
    let arch = plan.architecture();
    let strategy = &plan.execution().strategy;
    let trainer = &plan.execution().trainer;
    let data = &plan.execution().data;

    println!();
    println!("{}", "Run Plan".bold().cyan());
    println!("{}", "─".repeat(90).dimmed());
    println!("  {:<14} {}", "Identity:".bold(), plan.identity().as_str().green());
    println!("  {:<14} {}", "Digest:".bold(), plan.identity().short_digest().dimmed());
    println!();
    println!("  {:<14} {} ({})", "Model:".bold(), arch.size_identifier(), arch.family());
    println!("  {:<14} {} layers, seq {}", "", arch.num_layers(), arch.seq_length());
    println!("  {:<14} {}", "Pattern:".bold(), arch.pattern());
    println!();
    println!(
        "  {:<14} {} node(s) x {} device(s), TP{} PP{} CP{}",
        "Topology:".bold(),
        trainer.num_nodes,
        trainer.devices,
        strategy.tensor_parallel_size,
        strategy.pipeline_model_parallel_size,
        strategy.context_parallel_size
    );
    println!(
        "  {:<14} global {} (micro {})",
        "Batch:".bold(),
        plan.global_batch_size().to_string().yellow(),
        data.micro_batch_size
    );
    println!("  {:<14} {}", "Precision:".bold(), plan.execution().precision.precision);
    println!("  {:<14} {}", "Max steps:".bold(), trainer.max_steps);
    println!();
    println!("  {:<14} {}", "Resume:".bold(), describe_resume(plan.resume_state()));
    if let Some(checkpoint) = plan.policies().checkpoint() {
        println!("  {:<14} {}", "Checkpoints:".bold(), checkpoint.directory.display());
    }

    if !plan.policies().is_empty() {
        println!();
        println!("{}", "Policies".bold().cyan());
        println!("{}", "─".repeat(90).dimmed());
        for (index, policy) in plan.policies().iter().enumerate() {
            println!("  {}. {} {}", index + 1, policy.name().bold(), describe_policy(policy).dimmed());
        }
    }

    if let Some(wandb) = &plan.tracking().wandb {
        println!();
        println!("  {:<14} {} / {}", "W&B:".bold(), wandb.project, wandb.name);
    }
    println!();
}

fn describe_resume(state: &ResumeState) -> String {
    match state {
        ResumeState::NoCheckpointing => "checkpointing disabled".yellow().to_string(),
        ResumeState::FreshRun => "fresh run".to_string(),
        ResumeState::ResumingFromExplicitPath { path, load_optimizer_state } => {
            let optimizer = if *load_optimizer_state { " (with optimizer state)" } else { "" };
            format!("from {}{}", path.display(), optimizer)
        }
        ResumeState::ResumingFromAutoDetected { directory, ignored_restore_path } => {
            let mut text = format!("auto-resume from {}", directory.display());
            if let Some(ignored) = ignored_restore_path {
                text.push_str(&format!(" (ignoring {})", ignored.display()).yellow().to_string());
            }
            text
        }
    }
}

fn describe_policy(policy: &Policy) -> String {
    match policy {
        Policy::CheckpointResume(checkpoint) => format!("[top {} by {}]", checkpoint.save_top_k, checkpoint.monitor),
        Policy::Flops { family } => format!("[{}]", family),
        Policy::CommOverlap(overlap) => format!("[{}]", overlap.preset),
        Policy::GarbageCollection { interval_train, .. } => format!("[every {} steps]", interval_train),
        Policy::DdpParity { interval } => format!("[every {} steps]", interval),
        Policy::Profiling(profiling) => format!("[steps {}..{}]", profiling.start_step, profiling.end_step),
        Policy::LoraTransform { .. } | Policy::Preemption | Policy::ParameterDebugger => String::new(),
    }
}
