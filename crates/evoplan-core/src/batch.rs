//! Global batch size derivation.

use crate::error::{PlanError, PlanResult};
use serde::{Deserialize, Serialize};

/// Inputs that determine the global batch size when it is not given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTopology {
    pub micro_batch_size: u64,
    pub num_nodes: u64,
    pub devices_per_node: u64,
    pub tensor_parallel: u64,
    pub pipeline_parallel: u64,
    pub context_parallel: u64,
    pub grad_accumulation_steps: u64,
}

impl BatchTopology {
    #[must_use]
    pub fn world_size(&self) -> u64 {
        self.num_nodes.saturating_mul(self.devices_per_node)
    }

    #[must_use]
    pub fn model_parallel_size(&self) -> u64 {
        self.tensor_parallel
            .saturating_mul(self.pipeline_parallel)
            .saturating_mul(self.context_parallel)
    }

    /// Number of data-parallel replicas, when the world divides evenly.
    pub fn data_parallel_size(&self) -> PlanResult<u64> {
        let world_size = self.world_size();
        let model_parallel_size = self.model_parallel_size();
        if model_parallel_size == 0 || world_size % model_parallel_size != 0 {
            return Err(PlanError::NonIntegerParallelismDecomposition {
                world_size,
                model_parallel_size,
            });
        }
        Ok(world_size / model_parallel_size)
    }
}

/// Return the explicit global batch size untouched, or derive it.
///
/// An explicit value is never checked against the topology here; the
/// execution engine reports any inconsistency.
pub fn resolve_global_batch_size(explicit: Option<u64>, topology: &BatchTopology) -> PlanResult<u64> {
    if let Some(global) = explicit {
        return Ok(global);
    }

    let replicas = topology.data_parallel_size()?;
    topology
        .micro_batch_size
        .checked_mul(replicas)
        .and_then(|n| n.checked_mul(topology.grad_accumulation_steps))
        .ok_or_else(|| PlanError::value("global_batch_size", "derived global batch size overflows"))
}
