//! Integration tests for `evoplan resolve` and `evoplan identity`.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Run the binary inside `temp_dir` with no user configuration in sight.
fn evoplan(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("evoplan").unwrap();
    cmd.current_dir(temp_dir.path()).env("HOME", temp_dir.path()).env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_resolve_json() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["resolve", "--mock-data", "--devices", "8", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"global_batch_size\": 8"))
        .stdout(predicate::str::contains("\"family\": \"hyena\""))
        .stdout(predicate::str::contains("\"state\": \"fresh_run\""));
}

#[test]
fn test_resolve_human() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["resolve", "--mock-data", "--gc-interval", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Run Plan"))
        .stdout(predicate::str::contains("evo2-size-7b-TP1"))
        .stdout(predicate::str::contains("checkpoint_resume"))
        .stdout(predicate::str::contains("garbage_collection"));
}

#[test]
fn test_missing_data_source_reports_kind_and_options() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["resolve"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error[InvalidOptionCombination]"))
        .stderr(predicate::str::contains("mock_data"));
}

#[test]
fn test_non_integer_decomposition_fails() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["resolve", "--mock-data", "--num-nodes", "2", "--devices", "8", "--tensor-parallel-size", "3"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[NonIntegerParallelismDecomposition]"));
}

#[test]
fn test_mamba_rejects_output_bias() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["resolve", "--mock-data", "--model-size", "hybrid_mamba_8b", "--add-bias-output"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[UnsupportedFeatureForFamily]"))
        .stderr(predicate::str::contains("add_bias_output"));
}

#[test]
fn test_unknown_flag_is_rejected() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir).args(["resolve", "--mock-data", "--tensor-paralel-size", "2"]).assert().failure();
}

#[test]
fn test_identity_prints_label_only() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["identity", "--mock-data", "--devices", "8"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("evo2-size-7b-TP1-PP1-CP1-GBS8-MBS1"))
        .stdout(predicate::str::contains("Run Plan").not());
}

#[test]
fn test_identity_json_carries_digest() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["identity", "--mock-data", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"digest\""))
        .stdout(predicate::str::contains("\"version\": 2"));
}

#[test]
fn test_options_file_is_layered_under_flags() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("run.toml"), "mock_data = true\ndevices = 8\nseed = 7\n").unwrap();

    evoplan(&temp_dir)
        .args(["identity", "--options", "run.toml", "--devices", "4"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-GBS4-"))
        .stdout(predicate::str::contains("-SEED7-"));
}

#[test]
fn test_missing_options_file_fails() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["resolve", "--options", "missing.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.toml"));
}

#[test]
fn test_local_config_supplies_defaults_and_output_format() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
        temp_dir.path().join(".evoplanrc"),
        "[output]\nformat = \"json\"\n\n[defaults]\nmock_data = true\nmicro_batch_size = 2\n",
    )
    .unwrap();

    evoplan(&temp_dir)
        .args(["resolve"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"global_batch_size\": 2"));
}

#[test]
fn test_existing_checkpoint_is_auto_resumed() {
    let temp_dir = TempDir::new().unwrap();
    let checkpoints = temp_dir.path().join("results").join("evo2").join("checkpoints");
    std::fs::create_dir_all(checkpoints.join("epoch=0-step=99-consumed_samples=800.0")).unwrap();

    evoplan(&temp_dir)
        .args(["resolve", "--mock-data", "--ckpt-dir", "/pretrained/evo2_7b", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"resuming_from_auto_detected\""))
        .stdout(predicate::str::contains("/pretrained/evo2_7b"));
}

#[test]
fn test_model_overrides_flag() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["identity", "--mock-data", "--model-overrides", "recompute_method=block"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-OVRrecompute_method=block"));
}

#[test]
fn test_model_override_of_dedicated_option_fails() {
    let temp_dir = TempDir::new().unwrap();

    evoplan(&temp_dir)
        .args(["resolve", "--mock-data", "--model-overrides", "sequence_parallel=true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error[InvalidOptionCombination]"))
        .stderr(predicate::str::contains("sequence_parallel, model_overrides"));
}
