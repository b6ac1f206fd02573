//! Pass-through settings for the execution engine, derived once from the
//! validated options.

use crate::architecture::{ArchitectureSpec, ConfigValue};
use crate::options::{CheckpointFormat, DataSource, RunOptions};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSettings {
    pub source: DataSource,
    pub eod_pad_in_loss_mask: bool,
    pub tokenizer: &'static str,
    pub seq_length: u32,
    pub micro_batch_size: u32,
    pub global_batch_size: u64,
    pub workers: u32,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainerSettings {
    pub devices: u32,
    pub num_nodes: u32,
    pub max_steps: u64,
    pub val_check_interval: Option<u64>,
    pub limit_val_batches: u64,
    pub log_every_n_steps: u64,
    pub enable_checkpointing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DdpSettings {
    pub check_for_nan_in_grad: bool,
    pub overlap_grad_reduce: bool,
    pub overlap_param_gather: bool,
    pub grad_reduce_in_fp32: bool,
    pub align_param_gather: bool,
    pub average_in_collective: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategySettings {
    pub tensor_parallel_size: u32,
    pub pipeline_model_parallel_size: u32,
    pub context_parallel_size: u32,
    pub sequence_parallel: bool,
    pub ckpt_async_save: bool,
    pub ckpt_format: CheckpointFormat,
    pub ddp: DdpSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrecisionSettings {
    pub precision: &'static str,
    pub grad_reduce_in_fp32: bool,
    pub fp8: Option<&'static str>,
    pub fp8_amax_history_len: u32,
    pub fp8_amax_compute_algo: &'static str,
    /// Required whenever tensor-parallel overlap runs under fp8.
    pub fp8_wgrad: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerSettings {
    pub optimizer: &'static str,
    pub lr: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_eps: f64,
    pub weight_decay: f64,
    pub clip_grad: f64,
    pub use_distributed_optimizer: bool,
    pub log_num_zeros_in_grad: bool,
    pub use_precision_aware_optimizer: bool,
    pub main_grads_dtype: &'static str,
    pub no_weight_decay_embeddings: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerSettings {
    pub scheduler: &'static str,
    pub max_steps: u64,
    pub warmup_steps: u64,
    pub constant_steps: u64,
    pub min_lr: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSettings {
    pub data: DataSettings,
    pub trainer: TrainerSettings,
    pub strategy: StrategySettings,
    pub precision: PrecisionSettings,
    pub optimizer: OptimizerSettings,
    pub scheduler: SchedulerSettings,
    pub suppress_compile_errors: bool,
}

impl ExecutionSettings {
    #[must_use]
    pub fn derive(options: &RunOptions, arch: &ArchitectureSpec, global_batch_size: u64) -> Self {
        let max_steps = options.schedule.effective_max_steps();
        let schedule = &options.schedule;
        if schedule.warmup_steps.saturating_add(schedule.constant_steps) > max_steps {
            warn!(
                warmup_steps = schedule.warmup_steps,
                constant_steps = schedule.constant_steps,
                max_steps,
                "warmup and constant phases exceed the step budget; cosine decay never starts"
            );
        }

        let fp8 = options.precision.fp8;

        Self {
            data: DataSettings {
                source: options.data.source.clone(),
                eod_pad_in_loss_mask: options.data.eod_pad_in_loss_mask,
                tokenizer: "byte-level",
                seq_length: arch.seq_length(),
                micro_batch_size: options.batch.micro_batch_size,
                global_batch_size,
                workers: options.data.workers,
                seed: options.data.seed,
            },
            trainer: TrainerSettings {
                devices: options.topology.devices,
                num_nodes: options.topology.num_nodes,
                max_steps,
                val_check_interval: schedule.val_check_interval,
                limit_val_batches: schedule.limit_val_batches,
                log_every_n_steps: schedule.log_every_n_steps,
                enable_checkpointing: options.checkpoint.enabled,
            },
            strategy: StrategySettings {
                tensor_parallel_size: options.topology.tensor_parallel_size,
                pipeline_model_parallel_size: options.topology.pipeline_model_parallel_size,
                context_parallel_size: options.topology.context_parallel_size,
                sequence_parallel: options.topology.sequence_parallel,
                ckpt_async_save: options.checkpoint.async_save,
                ckpt_format: options.checkpoint.format,
                ddp: DdpSettings {
                    check_for_nan_in_grad: options.optimizer.check_for_nan_in_grad,
                    overlap_grad_reduce: options.comm.overlap_grad_reduce,
                    overlap_param_gather: options.comm.overlap_param_gather,
                    grad_reduce_in_fp32: options.precision.grad_reduce_in_fp32,
                    align_param_gather: options.comm.align_param_gather,
                    average_in_collective: options.effective_average_in_collective(),
                },
            },
            precision: PrecisionSettings {
                precision: "bf16-mixed",
                grad_reduce_in_fp32: options.precision.grad_reduce_in_fp32,
                fp8: fp8.then_some("hybrid"),
                fp8_amax_history_len: if fp8 { 16 } else { 1 },
                fp8_amax_compute_algo: if fp8 { "max" } else { "most_recent" },
                fp8_wgrad: fp8 && (options.precision.fp8_wgrad || options.comm.tp_comm_overlap),
            },
            optimizer: OptimizerSettings {
                optimizer: "adam",
                lr: schedule.lr,
                adam_beta1: options.optimizer.adam_beta1,
                adam_beta2: options.optimizer.adam_beta2,
                adam_eps: options.optimizer.adam_eps,
                weight_decay: options.optimizer.weight_decay,
                clip_grad: options.optimizer.clip_grad,
                use_distributed_optimizer: true,
                log_num_zeros_in_grad: options.optimizer.log_num_zeros_in_grad,
                use_precision_aware_optimizer: options.optimizer.use_precision_aware_optimizer,
                main_grads_dtype: if options.optimizer.bf16_main_grads { "bf16" } else { "fp32" },
                no_weight_decay_embeddings: arch
                    .setting("no_weight_decay_embeddings")
                    .and_then(ConfigValue::as_bool)
                    .unwrap_or(false),
            },
            scheduler: SchedulerSettings {
                scheduler: "cosine_annealing",
                max_steps,
                warmup_steps: schedule.warmup_steps,
                constant_steps: schedule.constant_steps,
                min_lr: schedule.min_lr,
            },
            suppress_compile_errors: options.suppress_compile_errors,
        }
    }
}
