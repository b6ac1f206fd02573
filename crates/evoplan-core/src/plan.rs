use crate::architecture::{self, ArchitectureSpec, ModelOverrides};
use crate::batch::resolve_global_batch_size;
use crate::catalog::Catalog;
use crate::error::PlanResult;
use crate::execution::ExecutionSettings;
use crate::identity::{self, RunIdentity};
use crate::layout::{CheckpointProbe, FsCheckpointProbe};
use crate::options::{RawOptions, RunOptions};
use crate::policy::{self, PolicySet, ResumeState};
use crate::tracking::TrackingSettings;
use serde::Serialize;
use tracing::{debug, info};

/// The resolved run plan. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunPlan {
    identity: RunIdentity,
    global_batch_size: u64,
    architecture: ArchitectureSpec,
    policies: PolicySet,
    execution: ExecutionSettings,
    tracking: TrackingSettings,
    options: RunOptions,
}

impl RunPlan {
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    #[must_use]
    pub fn global_batch_size(&self) -> u64 {
        self.global_batch_size
    }

    #[must_use]
    pub fn architecture(&self) -> &ArchitectureSpec {
        &self.architecture
    }

    #[must_use]
    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    #[must_use]
    pub fn resume_state(&self) -> &ResumeState {
        self.policies.resume_state()
    }

    #[must_use]
    pub fn execution(&self) -> &ExecutionSettings {
        &self.execution
    }

    #[must_use]
    pub fn tracking(&self) -> &TrackingSettings {
        &self.tracking
    }

    #[must_use]
    pub fn options(&self) -> &RunOptions {
        &self.options
    }
}

/// Turns options into a [`RunPlan`] against a catalog and a checkpoint probe.
#[derive(Debug, Clone)]
pub struct PlanResolver<P = FsCheckpointProbe> {
    catalog: Catalog,
    probe: P,
}

impl PlanResolver {
    /// Built-in catalog, local filesystem probe.
    #[must_use]
    pub fn new() -> Self {
        Self { catalog: Catalog::builtin(), probe: FsCheckpointProbe }
    }
}

impl Default for PlanResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CheckpointProbe> PlanResolver<P> {
    #[must_use]
    pub fn with_probe<Q: CheckpointProbe>(self, probe: Q) -> PlanResolver<Q> {
        PlanResolver { catalog: self.catalog, probe }
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Validate `raw` and resolve it. All-or-nothing.
    pub fn resolve(&self, raw: RawOptions) -> PlanResult<RunPlan> {
        debug!(options = raw.len(), "validating options");
        self.resolve_options(RunOptions::from_raw(raw)?)
    }

    pub fn resolve_options(&self, options: RunOptions) -> PlanResult<RunPlan> {
        let topology = options.batch_topology();
        let global_batch_size = resolve_global_batch_size(options.batch.global_batch_size, &topology)?;
        debug!(global_batch_size, world_size = topology.world_size(), "resolved batch size");

        let overrides = ModelOverrides::from_options(&options)?;
        let architecture = architecture::select(&self.catalog, &options.model.model_size, &overrides)?;

        let identity = identity::generate(&options, global_batch_size, &architecture);
        let policies = policy::assemble(&options, &architecture, &identity, &self.probe)?;

        let execution = ExecutionSettings::derive(&options, &architecture, global_batch_size);
        let tracking = TrackingSettings::derive(&options, &identity);

        info!(
            identity = %identity,
            family = %architecture.family(),
            resume = policies.resume_state().name(),
            "resolved run plan"
        );

        Ok(RunPlan { identity, global_batch_size, architecture, policies, execution, tracking, options })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlanError;
    use std::path::Path;

    struct NoCheckpoints;

    impl CheckpointProbe for NoCheckpoints {
        fn has_checkpoint(&self, _dir: &Path) -> PlanResult<bool> {
            Ok(false)
        }
    }

    fn resolver() -> PlanResolver<NoCheckpoints> {
        PlanResolver::new().with_probe(NoCheckpoints)
    }

    #[test]
    fn test_mock_7b_single_node() {
        let raw = RawOptions::new().with("mock_data", true).with("devices", 8_i64);
        let plan = resolver().resolve(raw).unwrap();
        assert_eq!(plan.global_batch_size(), 8);
        assert_eq!(plan.resume_state(), &ResumeState::FreshRun);
        assert_eq!(plan.policies().names(), vec!["checkpoint_resume"]);
    }

    #[test]
    fn test_resolution_is_all_or_nothing() {
        let raw = RawOptions::new()
            .with("mock_data", true)
            .with("num_nodes", 2_i64)
            .with("devices", 8_i64)
            .with("tensor_parallel_size", 3_i64);
        let err = resolver().resolve(raw).unwrap_err();
        assert!(matches!(err, PlanError::NonIntegerParallelismDecomposition { .. }));
    }

    #[test]
    fn test_disabled_checkpointing_has_no_resume() {
        let raw = RawOptions::new().with("mock_data", true).with("disable_checkpointing", true);
        let plan = resolver().resolve(raw).unwrap();
        assert_eq!(plan.resume_state(), &ResumeState::NoCheckpointing);
        assert!(plan.policies().is_empty());
        assert!(!plan.execution().trainer.enable_checkpointing);
    }
}
