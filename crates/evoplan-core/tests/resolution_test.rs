//! End-to-end resolution scenarios.

use evoplan_core::policy::{BF16_OVERLAP_PRESET, FP8_OVERLAP_PRESET};
use evoplan_core::{
    ArchitectureFamily, CheckpointProbe, ConfigValue, PlanError, PlanResolver, PlanResult, Policy, RawOptions,
    ResumeState,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct FixedProbe(bool);

impl CheckpointProbe for FixedProbe {
    fn has_checkpoint(&self, _dir: &Path) -> PlanResult<bool> {
        Ok(self.0)
    }
}

fn mock() -> RawOptions {
    RawOptions::new().with("mock_data", true)
}

fn resolve(raw: RawOptions) -> PlanResult<evoplan_core::RunPlan> {
    PlanResolver::new().with_probe(FixedProbe(false)).resolve(raw)
}

#[test]
fn test_mock_7b_on_one_node() {
    let raw = mock()
        .with("model_size", "7b")
        .with("num_nodes", 1_i64)
        .with("devices", 8_i64)
        .with("tensor_parallel_size", 1_i64)
        .with("pipeline_model_parallel_size", 1_i64)
        .with("context_parallel_size", 1_i64)
        .with("micro_batch_size", 1_i64)
        .with("grad_acc_batches", 1_i64);
    let plan = resolve(raw).unwrap();
    assert_eq!(plan.global_batch_size(), 8);
    assert_eq!(plan.architecture().family(), ArchitectureFamily::Hyena);
}

#[test]
fn test_two_nodes_tp4_is_valid() {
    let raw = mock().with("num_nodes", 2_i64).with("devices", 8_i64).with("tensor_parallel_size", 4_i64);
    let plan = resolve(raw).unwrap();
    assert_eq!(plan.global_batch_size(), 4);
}

#[test]
fn test_two_nodes_tp3_does_not_decompose() {
    let raw = mock().with("num_nodes", 2_i64).with("devices", 8_i64).with("tensor_parallel_size", 3_i64);
    let err = resolve(raw).unwrap_err();
    assert_eq!(err.kind(), "NonIntegerParallelismDecomposition");
}

#[test]
fn test_explicit_global_batch_size_wins() {
    let raw = mock().with("devices", 8_i64).with("global_batch_size", 256_i64);
    let plan = resolve(raw).unwrap();
    assert_eq!(plan.global_batch_size(), 256);
    assert_eq!(plan.execution().data.global_batch_size, 256);
    assert!(plan.identity().as_str().contains("-GBS256-"));
}

#[test]
fn test_output_bias_for_mamba_is_unsupported() {
    let raw = mock().with("model_size", "hybrid_mamba_8b").with("add_bias_output", true);
    let err = resolve(raw).unwrap_err();
    assert!(matches!(
        err,
        PlanError::UnsupportedFeatureForFamily { ref family, ref feature } if family == "mamba" && feature == "add_bias_output"
    ));
}

#[test]
fn test_hyena_only_flag_on_mamba_is_rejected() {
    let raw = mock().with("model_size", "hybrid_mamba_test").with("use_b2b_causal_conv1d", true);
    let err = resolve(raw).unwrap_err();
    assert_eq!(err.kind(), "InvalidOverrideForFamily");
}

#[test]
fn test_missing_data_source() {
    let err = resolve(RawOptions::new()).unwrap_err();
    assert_eq!(err.kind(), "InvalidOptionCombination");
}

#[test]
fn test_unknown_model_size() {
    let err = resolve(mock().with("model_size", "13b")).unwrap_err();
    assert_eq!(err.kind(), "UnknownSizeIdentifier");
    assert_eq!(err.options(), vec!["model_size"]);
}

#[test]
fn test_fresh_run_against_empty_result_dir() {
    let temp = TempDir::new().unwrap();
    let raw = mock().with("result_dir", temp.path().to_path_buf());
    let plan = PlanResolver::new().resolve(raw).unwrap();
    assert_eq!(plan.resume_state(), &ResumeState::FreshRun);

    let checkpoint = plan.policies().checkpoint().unwrap();
    assert_eq!(checkpoint.directory, temp.path().join("evo2").join("checkpoints"));
    assert_eq!(checkpoint.filename, "{epoch}-{step}-{consumed_samples}");
}

#[test]
fn test_existing_checkpoint_overrides_restore_path() {
    let temp = TempDir::new().unwrap();
    let checkpoints = temp.path().join("evo2").join("checkpoints");
    std::fs::create_dir_all(checkpoints.join("epoch=0-step=99-consumed_samples=800.0")).unwrap();

    let raw = mock().with("result_dir", temp.path().to_path_buf()).with("ckpt_dir", "/pretrained/evo2_7b");
    let plan = PlanResolver::new().resolve(raw).unwrap();
    assert_eq!(
        plan.resume_state(),
        &ResumeState::ResumingFromAutoDetected {
            directory: checkpoints,
            ignored_restore_path: Some(PathBuf::from("/pretrained/evo2_7b")),
        }
    );
}

#[test]
fn test_restore_path_without_checkpoint() {
    let raw = mock().with("ckpt_dir", "/pretrained/evo2_7b").with("restore_optimizer_from_ckpt", true);
    let plan = resolve(raw).unwrap();
    assert_eq!(
        plan.resume_state(),
        &ResumeState::ResumingFromExplicitPath {
            path: PathBuf::from("/pretrained/evo2_7b"),
            load_optimizer_state: true,
        }
    );
}

#[test]
fn test_identity_scoped_checkpoint_layout() {
    let raw = mock().with("result_dir", "/results").with("checkpoint_layout", "run_identity");
    let plan = resolve(raw).unwrap();
    let expected = PathBuf::from("/results/evo2").join(plan.identity().short_digest()).join("checkpoints");
    assert_eq!(plan.policies().checkpoint().unwrap().directory, expected);
}

#[test]
fn test_overlap_preset_follows_precision() {
    let raw = mock().with("use_megatron_comm_overlap_llama3_8k", true).with("tensor_parallel_size", 4_i64);
    let raw = raw.with("devices", 4_i64);
    let plan = resolve(raw.clone()).unwrap();
    match plan.policies().get("comm_overlap") {
        Some(Policy::CommOverlap(overlap)) => {
            assert_eq!(overlap.preset, BF16_OVERLAP_PRESET);
            assert_eq!(overlap.wgrad_deferral_limit, 22);
        }
        other => panic!("unexpected policy: {other:?}"),
    }
    assert_eq!(plan.architecture().setting("tp_comm_overlap"), Some(&ConfigValue::Bool(true)));

    let plan = resolve(raw.with("fp8", true)).unwrap();
    match plan.policies().get("comm_overlap") {
        Some(Policy::CommOverlap(overlap)) => assert_eq!(overlap.preset, FP8_OVERLAP_PRESET),
        other => panic!("unexpected policy: {other:?}"),
    }
}

#[test]
fn test_overlap_with_bf16_main_grads_is_unsupported() {
    let raw = mock()
        .with("use_megatron_comm_overlap_llama3_8k", true)
        .with("use_precision_aware_optimizer", true)
        .with("bf16_main_grads", true);
    let err = resolve(raw).unwrap_err();
    assert_eq!(err.kind(), "UnsupportedPrecisionCombination");
}

#[test]
fn test_diagnostics_compose() {
    let raw = mock()
        .with("gc_interval", 100_i64)
        .with("debug_ddp_parity_freq", 50_i64)
        .with("log_parameters_and_shapes", true)
        .with("create_tflops_callback", true)
        .with("nsys_profiling", true)
        .with("nsys_start_step", 10_i64)
        .with("enable_preemption", true)
        .with("lora_finetune", true);
    let plan = resolve(raw).unwrap();
    assert_eq!(
        plan.policies().names(),
        vec![
            "checkpoint_resume",
            "lora_transform",
            "preemption",
            "ddp_parity",
            "parameter_debugger",
            "flops",
            "garbage_collection",
            "profiling",
        ]
    );
    match plan.policies().get("profiling") {
        Some(Policy::Profiling(profiling)) => {
            assert_eq!(profiling.start_step, 10);
            assert_eq!(profiling.end_step, 500_000);
            assert_eq!(profiling.ranks, vec![0]);
        }
        other => panic!("unexpected policy: {other:?}"),
    }
}

#[test]
fn test_checkpoint_policy_precedes_callbacks() {
    let raw = mock().with("gc_interval", 1_i64);
    let plan = resolve(raw).unwrap();
    let first = plan.policies().iter().next().unwrap();
    assert_eq!(first.name(), "checkpoint_resume");
}

#[test]
fn test_tracking_name_defaults_to_identity() {
    let plan = resolve(mock().with("wandb_project", "evo2-pretrain")).unwrap();
    let wandb = plan.tracking().wandb.as_ref().unwrap();
    assert_eq!(wandb.name, plan.identity().as_str());
    assert_eq!(plan.tracking().metadata.identity_digest, plan.identity().digest());

    let plan = resolve(mock().with("wandb_project", "evo2-pretrain").with("wandb_run_name", "short")).unwrap();
    assert_eq!(plan.tracking().wandb.as_ref().unwrap().name, "short");
    assert_eq!(plan.tracking().metadata.run_identity, plan.identity().as_str());
}

#[test]
fn test_tracking_name_does_not_move_checkpoints() {
    let a = resolve(mock().with("wandb_project", "p")).unwrap();
    let b = resolve(mock().with("wandb_project", "p").with("wandb_run_name", "renamed")).unwrap();
    assert_eq!(a.policies().checkpoint(), b.policies().checkpoint());
}

#[test]
fn test_plan_serializes_to_json() {
    let plan = resolve(mock()).unwrap();
    let json = serde_json::to_value(&plan).unwrap();
    assert_eq!(json["global_batch_size"], 1);
    assert_eq!(json["architecture"]["family"], "hyena");
    assert_eq!(json["policies"][0]["policy"], "checkpoint_resume");
    assert_eq!(json["policies"][0]["resume"]["state"], "fresh_run");
    assert_eq!(json["execution"]["precision"]["precision"], "bf16-mixed");
}

#[test]
fn test_model_overrides_cannot_shadow_dedicated_options() {
    let raw = mock().with(
        "model_overrides",
        vec![
            "sequence_parallel=true".to_string(),
            "tp_comm_overlap=true".to_string(),
            "calculate_per_token_loss=false".to_string(),
        ],
    );
    let err = resolve(raw).unwrap_err();
    assert_eq!(err.kind(), "InvalidOptionCombination");
    assert!(err.options().contains(&"model_overrides".to_string()));
}

#[test]
fn test_architecture_agrees_with_strategy_and_identity() {
    let plan = resolve(mock().with("sequence_parallel", true).with("tensor_parallel_size", 2_i64).with("devices", 2_i64)).unwrap();
    assert_eq!(plan.architecture().setting("sequence_parallel"), Some(&ConfigValue::Bool(true)));
    assert!(plan.execution().strategy.sequence_parallel);
    assert!(plan.identity().as_str().contains("-SPTrue-"));
    assert_eq!(plan.architecture().setting("distribute_saved_activations"), Some(&ConfigValue::Bool(false)));
}

#[test]
fn test_effective_fp8_wgrad_is_part_of_identity() {
    let raw = mock().with("fp8", true).with("tensor_parallel_size", 4_i64).with("devices", 4_i64);
    let plain = resolve(raw.clone()).unwrap();
    let overlapped = resolve(raw.with("use_megatron_comm_overlap_llama3_8k", true)).unwrap();
    assert!(!plain.execution().precision.fp8_wgrad);
    assert!(overlapped.execution().precision.fp8_wgrad);
    assert_ne!(plain.identity(), overlapped.identity());
}

#[test]
fn test_restore_path_with_parent_components_inside_checkpoint_dir() {
    let temp = TempDir::new().unwrap();
    let restore = temp.path().join("evo2").join("..").join("evo2").join("checkpoints").join("seed");
    let raw = mock().with("result_dir", temp.path().to_path_buf()).with("ckpt_dir", restore);
    let err = resolve(raw).unwrap_err();
    assert_eq!(err.kind(), "ConflictingResumeSources");
}
