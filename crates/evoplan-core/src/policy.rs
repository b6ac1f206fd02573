//! Policy assembly.
//!
//! Each optional behavior is a declarative rule: a trigger over the run
//! options and a builder for its payload. Rules are evaluated independently;
//! the only ordering the set guarantees is by stage, so the checkpoint and
//! resume policy is always fixed before the engine and its callbacks exist.

use crate::architecture::ArchitectureSpec;
use crate::catalog::ArchitectureFamily;
use crate::error::{PlanError, PlanResult};
use crate::identity::RunIdentity;
use crate::layout::{CheckpointProbe, RunLayout};
use crate::options::{CheckpointFormat, CommBackend, RunOptions};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

pub const BF16_OVERLAP_PRESET: &str = "userbuffers_bf16_h100_h8192_tp4_mbs1_seqlen8192";
pub const FP8_OVERLAP_PRESET: &str = "userbuffers_fp8_h100_h8192_tp4_mbs1_seqlen8192";

/// Shape the overlap presets were tuned for: (tensor parallel, micro batch, sequence length).
const OVERLAP_TUNED_SHAPE: (u32, u32, u32) = (4, 1, 8192);

const CHECKPOINT_FILENAME: &str = "{epoch}-{step}-{consumed_samples}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStage {
    /// Resolved before the execution engine is constructed.
    PreEngine,
    /// Attached to the engine as a callback.
    Callback,
}

/// Checkpoint/resume state, resolved once per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResumeState {
    NoCheckpointing,
    FreshRun,
    ResumingFromExplicitPath { path: PathBuf, load_optimizer_state: bool },
    /// Auto-resume wins over an explicit restore path, which is kept here.
    ResumingFromAutoDetected { directory: PathBuf, ignored_restore_path: Option<PathBuf> },
}

impl ResumeState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoCheckpointing => "NoCheckpointing",
            Self::FreshRun => "FreshRun",
            Self::ResumingFromExplicitPath { .. } => "ResumingFromExplicitPath",
            Self::ResumingFromAutoDetected { .. } => "ResumingFromAutoDetected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointPolicy {
    pub directory: PathBuf,
    pub save_last: bool,
    pub monitor: String,
    pub save_top_k: i64,
    pub every_n_train_steps: Option<u64>,
    pub filename: String,
    pub async_save: bool,
    pub format: CheckpointFormat,
    pub resume: ResumeState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommOverlapPolicy {
    pub preset: String,
    pub backend: CommBackend,
    pub wgrad_deferral_limit: u32,
    pub overlap_param_gather_with_optimizer_step: bool,
    pub align_param_gather: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfilingPolicy {
    pub start_step: u64,
    pub end_step: u64,
    pub ranks: Vec<u32>,
    pub gen_shape: bool,
}

/// One optional behavior attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Policy {
    CheckpointResume(CheckpointPolicy),
    LoraTransform { checkpoint_path: Option<PathBuf> },
    Preemption,
    DdpParity { interval: u64 },
    ParameterDebugger,
    Flops { family: ArchitectureFamily },
    CommOverlap(CommOverlapPolicy),
    GarbageCollection { interval_train: u64, interval_val: u64 },
    Profiling(ProfilingPolicy),
}

impl Policy {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckpointResume(_) => "checkpoint_resume",
            Self::LoraTransform { .. } => "lora_transform",
            Self::Preemption => "preemption",
            Self::DdpParity { .. } => "ddp_parity",
            Self::ParameterDebugger => "parameter_debugger",
            Self::Flops { .. } => "flops",
            Self::CommOverlap(_) => "comm_overlap",
            Self::GarbageCollection { .. } => "garbage_collection",
            Self::Profiling(_) => "profiling",
        }
    }

    #[must_use]
    pub fn stage(&self) -> PolicyStage {
        match self {
            Self::CheckpointResume(_) => PolicyStage::PreEngine,
            _ => PolicyStage::Callback,
        }
    }
}

/// Ordered set of active policies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PolicySet {
    policies: Vec<Policy>,
}

impl PolicySet {
    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Policy> {
        self.policies.iter().find(|p| p.name() == name)
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.policies.iter().map(Policy::name).collect()
    }

    #[must_use]
    pub fn checkpoint(&self) -> Option<&CheckpointPolicy> {
        self.policies.iter().find_map(|p| match p {
            Policy::CheckpointResume(c) => Some(c),
            _ => None,
        })
    }

    #[must_use]
    pub fn resume_state(&self) -> &ResumeState {
        self.checkpoint().map_or(&ResumeState::NoCheckpointing, |c| &c.resume)
    }
}

struct AssemblyContext<'a> {
    options: &'a RunOptions,
    arch: &'a ArchitectureSpec,
    identity: &'a RunIdentity,
    probe: &'a dyn CheckpointProbe,
}

struct PolicyRule {
    trigger: fn(&RunOptions) -> bool,
    build: fn(&AssemblyContext<'_>) -> PlanResult<Policy>,
}

const RULES: &[PolicyRule] = &[
    PolicyRule { trigger: |o| o.checkpoint.enabled, build: checkpoint_resume },
    PolicyRule {
        trigger: |o| o.lora.is_some(),
        build: |ctx| {
            let checkpoint_path = ctx.options.lora.as_ref().and_then(|l| l.checkpoint_path.clone());
            Ok(Policy::LoraTransform { checkpoint_path })
        },
    },
    PolicyRule { trigger: |o| o.checkpoint.enable_preemption, build: |_| Ok(Policy::Preemption) },
    PolicyRule {
        trigger: |o| o.diagnostics.ddp_parity_interval > 0,
        build: |ctx| Ok(Policy::DdpParity { interval: ctx.options.diagnostics.ddp_parity_interval }),
    },
    PolicyRule {
        trigger: |o| o.diagnostics.log_parameters_and_shapes,
        build: |_| Ok(Policy::ParameterDebugger),
    },
    PolicyRule {
        trigger: |o| o.diagnostics.tflops,
        build: |ctx| Ok(Policy::Flops { family: ctx.arch.family() }),
    },
    PolicyRule { trigger: |o| o.comm.tp_comm_overlap, build: comm_overlap },
    PolicyRule {
        trigger: |o| o.diagnostics.gc_interval > 0,
        build: |ctx| {
            let interval = ctx.options.diagnostics.gc_interval;
            Ok(Policy::GarbageCollection { interval_train: interval, interval_val: interval })
        },
    },
    PolicyRule {
        trigger: |o| o.diagnostics.profiling.enabled,
        build: |ctx| {
            let options = ctx.options;
            let profiling = &options.diagnostics.profiling;
            Ok(Policy::Profiling(ProfilingPolicy {
                start_step: profiling.start_step,
                end_step: profiling.end_step.unwrap_or(options.schedule.max_steps),
                ranks: profiling.ranks.clone(),
                gen_shape: true,
            }))
        },
    },
];

/// Build the policy set. The identity is an input: the checkpoint location
/// is derived from it, never the other way round.
pub fn assemble(
    options: &RunOptions,
    arch: &ArchitectureSpec,
    identity: &RunIdentity,
    probe: &dyn CheckpointProbe,
) -> PlanResult<PolicySet> {
    let ctx = AssemblyContext { options, arch, identity, probe };

    let mut policies = Vec::new();
    for rule in RULES {
        if (rule.trigger)(options) {
            policies.push((rule.build)(&ctx)?);
        }
    }
    policies.sort_by_key(Policy::stage);

    let set = PolicySet { policies };
    debug!(policies = ?set.names(), "assembled policies");
    Ok(set)
}

fn checkpoint_resume(ctx: &AssemblyContext<'_>) -> PlanResult<Policy> {
    let checkpoint = &ctx.options.checkpoint;
    let directory = RunLayout::from_options(checkpoint).checkpoints_dir(ctx.identity);
    let resume = resolve_resume(
        checkpoint.restore_path.as_deref(),
        checkpoint.restore_optimizer,
        &directory,
        ctx.probe,
    )?;
    info!(directory = %directory.display(), state = resume.name(), "resolved checkpoint state");

    Ok(Policy::CheckpointResume(CheckpointPolicy {
        directory,
        save_last: checkpoint.save_last,
        monitor: checkpoint.monitor.clone(),
        save_top_k: checkpoint.save_top_k,
        every_n_train_steps: ctx.options.schedule.val_check_interval,
        filename: CHECKPOINT_FILENAME.to_string(),
        async_save: checkpoint.async_save,
        format: checkpoint.format,
        resume,
    }))
}

/// Absolute form with `.` and `..` folded away. Symlinks are not followed.
fn normalized(path: &Path) -> PlanResult<PathBuf> {
    let mut folded = PathBuf::new();
    for component in std::path::absolute(path)?.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                folded.pop();
            }
            other => folded.push(other),
        }
    }
    Ok(folded)
}

/// Decide the resume state for a run with checkpointing enabled.
///
/// An existing checkpoint under `directory` wins over `restore_path`. A
/// restore path inside `directory` is rejected: it would itself be an
/// auto-resume candidate on the next restart.
pub fn resolve_resume(
    restore_path: Option<&Path>,
    load_optimizer_state: bool,
    directory: &Path,
    probe: &dyn CheckpointProbe,
) -> PlanResult<ResumeState> {
    if let Some(restore) = restore_path {
        if normalized(restore)?.starts_with(normalized(directory)?) {
            return Err(PlanError::ConflictingResumeSources {
                restore_path: restore.to_path_buf(),
                checkpoint_dir: directory.to_path_buf(),
            });
        }
    }

    if probe.has_checkpoint(directory)? {
        if let Some(ignored) = restore_path {
            warn!(
                restore_path = %ignored.display(),
                "existing checkpoint found; auto-resume takes precedence over the restore path"
            );
        }
        return Ok(ResumeState::ResumingFromAutoDetected {
            directory: directory.to_path_buf(),
            ignored_restore_path: restore_path.map(Path::to_path_buf),
        });
    }

    Ok(match restore_path {
        Some(path) => ResumeState::ResumingFromExplicitPath { path: path.to_path_buf(), load_optimizer_state },
        None => ResumeState::FreshRun,
    })
}

fn comm_overlap(ctx: &AssemblyContext<'_>) -> PlanResult<Policy> {
    let options = ctx.options;
    let preset = if options.precision.fp8 { FP8_OVERLAP_PRESET } else { BF16_OVERLAP_PRESET };

    if options.optimizer.bf16_main_grads {
        return Err(PlanError::UnsupportedPrecisionCombination {
            preset: preset.to_string(),
            reason: "bf16 main gradients were never validated with userbuffer overlap".to_string(),
        });
    }

    let shape = (
        options.topology.tensor_parallel_size,
        options.batch.micro_batch_size,
        ctx.arch.seq_length(),
    );
    if shape != OVERLAP_TUNED_SHAPE {
        warn!(
            preset,
            tensor_parallel = shape.0,
            micro_batch = shape.1,
            seq_length = shape.2,
            "communication-overlap preset used outside the shape it was tuned for"
        );
    }

    Ok(Policy::CommOverlap(CommOverlapPolicy {
        preset: preset.to_string(),
        backend: options.comm.backend,
        wgrad_deferral_limit: 22,
        overlap_param_gather_with_optimizer_step: false,
        align_param_gather: options.comm.align_param_gather,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(bool);

    impl CheckpointProbe for FixedProbe {
        fn has_checkpoint(&self, _dir: &Path) -> PlanResult<bool> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_fresh_run() {
        let state = resolve_resume(None, false, Path::new("/r/evo2/checkpoints"), &FixedProbe(false)).unwrap();
        assert_eq!(state, ResumeState::FreshRun);
    }

    #[test]
    fn test_explicit_path_without_checkpoint() {
        let state =
            resolve_resume(Some(Path::new("/seed")), true, Path::new("/r/evo2/checkpoints"), &FixedProbe(false))
                .unwrap();
        assert_eq!(
            state,
            ResumeState::ResumingFromExplicitPath { path: PathBuf::from("/seed"), load_optimizer_state: true }
        );
    }

    #[test]
    fn test_auto_detected_wins_and_records_ignored_path() {
        let dir = Path::new("/r/evo2/checkpoints");
        let state = resolve_resume(Some(Path::new("/seed")), false, dir, &FixedProbe(true)).unwrap();
        assert_eq!(
            state,
            ResumeState::ResumingFromAutoDetected {
                directory: dir.to_path_buf(),
                ignored_restore_path: Some(PathBuf::from("/seed")),
            }
        );
    }

    #[test]
    fn test_restore_path_inside_checkpoint_dir_conflicts() {
        let err = resolve_resume(
            Some(Path::new("./r/evo2/checkpoints/epoch=0-step=10")),
            false,
            Path::new("r/evo2/checkpoints"),
            &FixedProbe(false),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ConflictingResumeSources");
    }

    #[test]
    fn test_absolute_restore_path_inside_relative_checkpoint_dir_conflicts() {
        let restore = std::env::current_dir().unwrap().join("results/evo2/checkpoints/epoch=0-step=10");
        let err = resolve_resume(Some(&restore), false, Path::new("./results/evo2/checkpoints"), &FixedProbe(false))
            .unwrap_err();
        assert_eq!(err.kind(), "ConflictingResumeSources");
    }

    #[test]
    fn test_parent_components_are_folded_before_comparing() {
        let dir = Path::new("results/evo2/checkpoints");
        let err = resolve_resume(Some(Path::new("results/evo2/../evo2/checkpoints/x")), false, dir, &FixedProbe(false))
            .unwrap_err();
        assert_eq!(err.kind(), "ConflictingResumeSources");

        let outside = Path::new("results/evo2/checkpoints/../seed");
        let state = resolve_resume(Some(outside), false, dir, &FixedProbe(false)).unwrap();
        assert_eq!(
            state,
            ResumeState::ResumingFromExplicitPath { path: outside.to_path_buf(), load_optimizer_state: false }
        );
    }

    #[test]
    fn test_stage_ordering() {
        assert!(PolicyStage::PreEngine < PolicyStage::Callback);
        assert_eq!(Policy::Preemption.stage(), PolicyStage::Callback);
    }
}
