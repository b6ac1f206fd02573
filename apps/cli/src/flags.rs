//! Command-line flags for every resolution option.
//!
//! Each `--kebab-case` flag maps to the `snake_case` option of the same name.
//! Nothing here carries a default: an absent flag leaves the option to the
//! lower layers (options file, config defaults) and finally the resolver.

use clap::Args;
use evoplan_core::RawOptions;
use std::path::PathBuf;

#[derive(Args, Debug, Clone, Default)]
pub struct OptionFlags {
    // Data
    /// Path to the blended training dataset configuration
    #[arg(long, help_heading = "Data")]
    pub dataset_config: Option<PathBuf>,

    /// Train on mock data instead of a dataset
    #[arg(long, help_heading = "Data")]
    pub mock_data: bool,

    /// Directory dataset prefixes are resolved against
    #[arg(long, help_heading = "Data")]
    pub dataset_dir: Option<PathBuf>,

    /// Training sequence length [default: catalog value]
    #[arg(long, help_heading = "Data")]
    pub seq_length: Option<i64>,

    /// Data loader workers [default: 8]
    #[arg(long, help_heading = "Data")]
    pub workers: Option<i64>,

    /// Random seed [default: 1234]
    #[arg(long, help_heading = "Data")]
    pub seed: Option<i64>,

    /// Predict EOD/pad tokens (mask them in the loss)
    #[arg(long, help_heading = "Data")]
    pub eod_pad_in_loss_mask: bool,

    // Topology
    /// Number of nodes [default: 1]
    #[arg(long, help_heading = "Topology")]
    pub num_nodes: Option<i64>,

    /// Devices per node [default: 1]
    #[arg(long, help_heading = "Topology")]
    pub devices: Option<i64>,

    /// Tensor parallel degree [default: 1]
    #[arg(long, help_heading = "Topology")]
    pub tensor_parallel_size: Option<i64>,

    /// Pipeline parallel degree [default: 1]
    #[arg(long, help_heading = "Topology")]
    pub pipeline_model_parallel_size: Option<i64>,

    /// Context parallel degree [default: 1]
    #[arg(long, help_heading = "Topology")]
    pub context_parallel_size: Option<i64>,

    /// Enable sequence parallelism
    #[arg(long, help_heading = "Topology")]
    pub sequence_parallel: bool,

    // Batch and schedule
    /// Micro batch size [default: 1]
    #[arg(long, help_heading = "Batch and schedule")]
    pub micro_batch_size: Option<i64>,

    /// Global batch size [default: derived from the topology]
    #[arg(long, help_heading = "Batch and schedule")]
    pub global_batch_size: Option<i64>,

    /// Gradient accumulation steps [default: 1]
    #[arg(long, help_heading = "Batch and schedule")]
    pub grad_acc_batches: Option<i64>,

    /// Optimizer steps [default: 500000]
    #[arg(long, help_heading = "Batch and schedule")]
    pub max_steps: Option<i64>,

    /// Stop training early at this step
    #[arg(long, help_heading = "Batch and schedule")]
    pub early_stop_on_step: Option<i64>,

    /// Steps at constant learning rate before annealing [default: 80000]
    #[arg(long, help_heading = "Batch and schedule")]
    pub constant_steps: Option<i64>,

    /// Linear warmup steps [default: 2500]
    #[arg(long, help_heading = "Batch and schedule")]
    pub warmup_steps: Option<i64>,

    /// Steps between validation runs and checkpoints
    #[arg(long, help_heading = "Batch and schedule")]
    pub val_check_interval: Option<i64>,

    /// Validation batches per run [default: 20]
    #[arg(long, help_heading = "Batch and schedule")]
    pub limit_val_batches: Option<i64>,

    /// Steps between log lines [default: 1]
    #[arg(long, help_heading = "Batch and schedule")]
    pub log_every_n_steps: Option<i64>,

    // Optimizer
    /// Learning rate [default: 3e-4]
    #[arg(long, help_heading = "Optimizer")]
    pub lr: Option<f64>,

    /// Minimum learning rate [default: 3e-5]
    #[arg(long, help_heading = "Optimizer")]
    pub min_lr: Option<f64>,

    /// Weight decay [default: 0.01]
    #[arg(long, help_heading = "Optimizer")]
    pub wd: Option<f64>,

    /// Adam beta1 [default: 0.9]
    #[arg(long, help_heading = "Optimizer")]
    pub adam_beta1: Option<f64>,

    /// Adam beta2 [default: 0.95]
    #[arg(long, help_heading = "Optimizer")]
    pub adam_beta2: Option<f64>,

    /// Adam epsilon [default: 1e-8]
    #[arg(long, help_heading = "Optimizer")]
    pub adam_eps: Option<f64>,

    /// Gradient clipping norm [default: 1.0]
    #[arg(long, help_heading = "Optimizer")]
    pub clip_grad: Option<f64>,

    /// Keep main weights in fp32 inside the optimizer
    #[arg(long, help_heading = "Optimizer")]
    pub use_precision_aware_optimizer: bool,

    /// Keep main gradients in bf16 (precision-aware optimizer only)
    #[arg(long, help_heading = "Optimizer")]
    pub bf16_main_grads: bool,

    /// Average optimizer state in the collective
    #[arg(long, help_heading = "Optimizer")]
    pub average_in_collective: bool,

    /// Log the number of zeros in gradients
    #[arg(long, help_heading = "Optimizer")]
    pub log_num_zeros_in_grad: bool,

    /// Skip NaN checks on gradients
    #[arg(long, help_heading = "Optimizer")]
    pub no_check_for_nan_in_grad: bool,

    // Precision and communication
    /// Train with FP8
    #[arg(long, help_heading = "Precision and communication")]
    pub fp8: bool,

    /// Faster, possibly less accurate FP8 weight gradients
    #[arg(long, help_heading = "Precision and communication")]
    pub fp8_wgrad: bool,

    /// Reduce gradients in fp32
    #[arg(long, help_heading = "Precision and communication")]
    pub grad_reduce_in_fp32: bool,

    /// Use the tuned tensor-parallel communication overlap preset
    #[arg(long, help_heading = "Precision and communication")]
    pub use_megatron_comm_overlap_llama3_8k: bool,

    /// Tensor-parallel communication backend (nccl, mpi, gloo) [default: nccl]
    #[arg(long, help_heading = "Precision and communication")]
    pub tp_comm_overlap_backend: Option<String>,

    /// Align parameter gathers across pipeline stages
    #[arg(long, help_heading = "Precision and communication")]
    pub align_param_gather: bool,

    /// Overlap parameter gathers with compute
    #[arg(long, help_heading = "Precision and communication")]
    pub overlap_param_gather: bool,

    /// Overlap gradient reduction with compute
    #[arg(long, help_heading = "Precision and communication")]
    pub overlap_grad_reduce: bool,

    // Model
    /// Model size identifier, see `evoplan catalog` [default: 7b]
    #[arg(long, help_heading = "Model")]
    pub model_size: Option<String>,

    /// Add a bias to the output layer (Hyena only)
    #[arg(long, help_heading = "Model")]
    pub add_bias_output: bool,

    /// Layer pattern override; must match --num-layers in length
    #[arg(long, help_heading = "Model")]
    pub hybrid_override_pattern: Option<String>,

    /// Layer count override
    #[arg(long, help_heading = "Model")]
    pub num_layers: Option<i64>,

    /// Hidden dropout probability [default: 0.0]
    #[arg(long, help_heading = "Model")]
    pub hidden_dropout: Option<f64>,

    /// Attention dropout probability [default: 0.0]
    #[arg(long, help_heading = "Model")]
    pub attention_dropout: Option<f64>,

    /// Use the back-to-back causal conv1d kernel (Hyena only)
    #[arg(long, help_heading = "Model")]
    pub use_b2b_causal_conv1d: bool,

    /// Disable activation checkpointing
    #[arg(long, help_heading = "Model")]
    pub no_activation_checkpointing: bool,

    /// Use selective activation checkpointing
    #[arg(long, help_heading = "Model")]
    pub selective_activation_checkpointing: bool,

    /// Layers to recompute under full activation checkpointing
    #[arg(long, help_heading = "Model")]
    pub activation_checkpoint_recompute_num_layers: Option<i64>,

    /// Use the fused cross-entropy loss
    #[arg(long, help_heading = "Model")]
    pub cross_entropy_loss_fusion: bool,

    /// Turn off fp32 residual connections
    #[arg(long, help_heading = "Model")]
    pub no_fp32_residual_connection: bool,

    /// Do not renormalize loss weights
    #[arg(long, help_heading = "Model")]
    pub no_renormalize_loss: bool,

    /// Use the targeted variance loss
    #[arg(long, help_heading = "Model")]
    pub use_targeted_variance_loss: bool,

    /// Do not compute the loss per token
    #[arg(long, help_heading = "Model")]
    pub no_calculate_per_token_loss: bool,

    /// Initialize embeddings from Normal(0, 1) (Mamba only)
    #[arg(long, help_heading = "Model")]
    pub spike_no_more_embedding_init: bool,

    /// No weight decay on embeddings (Mamba only)
    #[arg(long, help_heading = "Model")]
    pub no_weight_decay_embeddings: bool,

    /// Loss weight for lowercase bases (Mamba only) [default: 0.1]
    #[arg(long, help_heading = "Model")]
    pub mamba_lowercase_loss_weight: Option<f64>,

    /// Rotary sequence length interpolation factor
    #[arg(long, help_heading = "Model")]
    pub seq_len_interpolation_factor: Option<f64>,

    /// Free-form architecture overrides
    #[arg(long, value_name = "KEY=VALUE", num_args = 1.., help_heading = "Model")]
    pub model_overrides: Vec<String>,

    // LoRA
    /// Fine-tune with LoRA adapters (Hyena only)
    #[arg(long, help_heading = "LoRA")]
    pub lora_finetune: bool,

    /// LoRA adapter checkpoint to start from
    #[arg(long, help_heading = "LoRA")]
    pub lora_checkpoint_path: Option<PathBuf>,

    // Checkpointing
    /// Turn checkpointing off entirely
    #[arg(long, help_heading = "Checkpointing")]
    pub disable_checkpointing: bool,

    /// Checkpoint to initialize from
    #[arg(long, help_heading = "Checkpointing")]
    pub ckpt_dir: Option<PathBuf>,

    /// Also restore optimizer state from --ckpt-dir
    #[arg(long, help_heading = "Checkpointing")]
    pub restore_optimizer_from_ckpt: bool,

    /// Checkpoints to keep by monitored metric [default: 5]
    #[arg(long, allow_hyphen_values = true, help_heading = "Checkpointing")]
    pub save_top_k: Option<i64>,

    /// Metric monitored for checkpoint ranking [default: val_loss]
    #[arg(long, help_heading = "Checkpointing")]
    pub metric_to_monitor_for_checkpoints: Option<String>,

    /// Do not keep the last checkpoint
    #[arg(long, help_heading = "Checkpointing")]
    pub no_save_last_checkpoint: bool,

    /// Save checkpoints asynchronously
    #[arg(long, help_heading = "Checkpointing")]
    pub ckpt_async_save: bool,

    /// Checkpoint format (torch_dist, zarr) [default: torch_dist]
    #[arg(long, help_heading = "Checkpointing")]
    pub ckpt_format: Option<String>,

    /// Checkpoint directory layout (experiment, run_identity) [default: experiment]
    #[arg(long, help_heading = "Checkpointing")]
    pub checkpoint_layout: Option<String>,

    /// Result directory [default: ./results]
    #[arg(long, help_heading = "Checkpointing")]
    pub result_dir: Option<PathBuf>,

    /// Experiment name [default: evo2]
    #[arg(long, help_heading = "Checkpointing")]
    pub experiment_name: Option<String>,

    /// Save a checkpoint when the scheduler preempts the job
    #[arg(long, help_heading = "Checkpointing")]
    pub enable_preemption: bool,

    // Diagnostics
    /// Synchronized garbage collection every N steps
    #[arg(long, help_heading = "Diagnostics")]
    pub gc_interval: Option<i64>,

    /// Check DDP weight parity every N steps
    #[arg(long, help_heading = "Diagnostics")]
    pub debug_ddp_parity_freq: Option<i64>,

    /// Log parameter shapes and dtypes
    #[arg(long, help_heading = "Diagnostics")]
    pub log_parameters_and_shapes: bool,

    /// Report model TFLOPs
    #[arg(long, help_heading = "Diagnostics")]
    pub create_tflops_callback: bool,

    /// Enable nsys profiling over a step range
    #[arg(long, help_heading = "Diagnostics")]
    pub nsys_profiling: bool,

    /// First profiled step [default: 0]
    #[arg(long, help_heading = "Diagnostics")]
    pub nsys_start_step: Option<i64>,

    /// Last profiled step [default: --max-steps]
    #[arg(long, help_heading = "Diagnostics")]
    pub nsys_end_step: Option<i64>,

    /// Ranks to profile [default: 0]
    #[arg(long, num_args = 1.., help_heading = "Diagnostics")]
    pub nsys_ranks: Option<Vec<i64>>,

    // Tracking
    /// Write a TensorBoard log
    #[arg(long, help_heading = "Tracking")]
    pub create_tensorboard_logger: bool,

    /// Weights & Biases project; enables wandb tracking
    #[arg(long, help_heading = "Tracking")]
    pub wandb_project: Option<String>,

    /// Weights & Biases team
    #[arg(long, help_heading = "Tracking")]
    pub wandb_entity: Option<String>,

    /// Tags for the run
    #[arg(long, num_args = 1.., help_heading = "Tracking")]
    pub wandb_tags: Option<Vec<String>>,

    /// Run group
    #[arg(long, help_heading = "Tracking")]
    pub wandb_group: Option<String>,

    /// Run job type
    #[arg(long, help_heading = "Tracking")]
    pub wandb_job_type: Option<String>,

    /// Display name for the run [default: the run identity]
    #[arg(long, help_heading = "Tracking")]
    pub wandb_run_name: Option<String>,

    /// Run id, used to resume a tracked run
    #[arg(long, help_heading = "Tracking")]
    pub wandb_id: Option<String>,

    /// Log anonymously
    #[arg(long, help_heading = "Tracking")]
    pub wandb_anonymous: bool,

    /// Upload checkpoints to wandb
    #[arg(long, help_heading = "Tracking")]
    pub wandb_log_model: bool,

    /// Run wandb offline
    #[arg(long, help_heading = "Tracking")]
    pub wandb_offline: bool,

    // Execution
    /// Fail on compile errors instead of suppressing them
    #[arg(long, help_heading = "Execution")]
    pub strict_compile_errors: bool,
}

/// Copy set flags into `raw` under their own field names.
macro_rules! collect {
    ($raw:ident, $flags:ident; switches: [$($switch:ident),* $(,)?]; values: [$($value:ident),* $(,)?]) => {{
        $(
            if $flags.$switch {
                $raw.insert(stringify!($switch), true);
            }
        )*
        $(
            if let Some(value) = $flags.$value {
                $raw.insert(stringify!($value), value);
            }
        )*
    }};
}

impl OptionFlags {
    /// Only flags that were given; switches appear as `true`.
    pub fn into_raw(self) -> RawOptions {
        let mut raw = RawOptions::new();
        let flags = self;

        collect!(raw, flags;
            switches: [
                mock_data, eod_pad_in_loss_mask, sequence_parallel,
                use_precision_aware_optimizer, bf16_main_grads, average_in_collective,
                log_num_zeros_in_grad, no_check_for_nan_in_grad,
                fp8, fp8_wgrad, grad_reduce_in_fp32, use_megatron_comm_overlap_llama3_8k,
                align_param_gather, overlap_param_gather, overlap_grad_reduce,
                add_bias_output, use_b2b_causal_conv1d, no_activation_checkpointing,
                selective_activation_checkpointing, cross_entropy_loss_fusion,
                no_fp32_residual_connection, no_renormalize_loss, use_targeted_variance_loss,
                no_calculate_per_token_loss, spike_no_more_embedding_init, no_weight_decay_embeddings,
                lora_finetune,
                disable_checkpointing, restore_optimizer_from_ckpt, no_save_last_checkpoint,
                ckpt_async_save, enable_preemption,
                log_parameters_and_shapes, create_tflops_callback, nsys_profiling,
                create_tensorboard_logger, wandb_anonymous, wandb_log_model, wandb_offline,
                strict_compile_errors,
            ];
            values: [
                dataset_config, dataset_dir, seq_length, workers, seed,
                num_nodes, devices, tensor_parallel_size, pipeline_model_parallel_size, context_parallel_size,
                micro_batch_size, global_batch_size, grad_acc_batches, max_steps, early_stop_on_step,
                constant_steps, warmup_steps, val_check_interval, limit_val_batches, log_every_n_steps,
                lr, min_lr, wd, adam_beta1, adam_beta2, adam_eps, clip_grad,
                tp_comm_overlap_backend,
                model_size, hybrid_override_pattern, num_layers, hidden_dropout, attention_dropout,
                activation_checkpoint_recompute_num_layers, mamba_lowercase_loss_weight,
                seq_len_interpolation_factor,
                lora_checkpoint_path,
                ckpt_dir, save_top_k, metric_to_monitor_for_checkpoints, ckpt_format, checkpoint_layout,
                result_dir, experiment_name,
                gc_interval, debug_ddp_parity_freq, nsys_start_step, nsys_end_step, nsys_ranks,
                wandb_project, wandb_entity, wandb_tags, wandb_group, wandb_job_type, wandb_run_name, wandb_id,
            ]
        );

        if !flags.model_overrides.is_empty() {
            raw.insert("model_overrides", flags.model_overrides);
        }
        raw
    }
}
