//! Run options: the flat option mapping handed over by a front end, and the
//! validated, grouped `RunOptions` every later stage reads from.

use crate::architecture::ConfigValue;
use crate::batch::BatchTopology;
use crate::error::{PlanError, PlanResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A single already-parsed option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    IntList(Vec<i64>),
    StrList(Vec<String>),
    Path(PathBuf),
}

impl OptionValue {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::IntList(_) => "list of integers",
            Self::StrList(_) => "list of strings",
            Self::Path(_) => "path",
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<PathBuf> for OptionValue {
    fn from(v: PathBuf) -> Self {
        Self::Path(v)
    }
}

impl From<Vec<i64>> for OptionValue {
    fn from(v: Vec<i64>) -> Self {
        Self::IntList(v)
    }
}

impl From<Vec<String>> for OptionValue {
    fn from(v: Vec<String>) -> Self {
        Self::StrList(v)
    }
}

/// Flat mapping of option name to typed value.
///
/// Keys are kept sorted, so two mappings built in different orders compare
/// and resolve identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawOptions(BTreeMap<String, OptionValue>);

impl RawOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Option<OptionValue> {
        self.0.insert(key.into(), value.into())
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        self.0.remove(key)
    }

    /// Layer `other` on top of `self`; keys present in `other` win.
    pub fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, OptionValue)> for RawOptions {
    fn from_iter<I: IntoIterator<Item = (String, OptionValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Consumes a `RawOptions`, handing out typed values and rejecting leftovers.
struct OptionReader {
    values: BTreeMap<String, OptionValue>,
}

fn mismatch(name: &str, expected: &str, got: &OptionValue) -> PlanError {
    PlanError::value(name, format!("expected {expected}, got {}", got.type_name()))
}

impl OptionReader {
    fn new(raw: RawOptions) -> Self {
        Self { values: raw.0 }
    }

    fn opt_bool(&mut self, name: &str) -> PlanResult<Option<bool>> {
        match self.values.remove(name) {
            None => Ok(None),
            Some(OptionValue::Bool(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(name, "boolean", &other)),
        }
    }

    fn flag(&mut self, name: &str) -> PlanResult<bool> {
        Ok(self.opt_bool(name)?.unwrap_or(false))
    }

    fn opt_int(&mut self, name: &str) -> PlanResult<Option<i64>> {
        match self.values.remove(name) {
            None => Ok(None),
            Some(OptionValue::Int(v)) => Ok(Some(v)),
            Some(other) => Err(mismatch(name, "integer", &other)),
        }
    }

    fn opt_u64(&mut self, name: &str, min: u64) -> PlanResult<Option<u64>> {
        let Some(v) = self.opt_int(name)? else {
            return Ok(None);
        };
        let v = u64::try_from(v).map_err(|_| PlanError::value(name, format!("must be >= {min}, got {v}")))?;
        if v < min {
            return Err(PlanError::value(name, format!("must be >= {min}, got {v}")));
        }
        Ok(Some(v))
    }

    fn opt_u32(&mut self, name: &str, min: u32) -> PlanResult<Option<u32>> {
        match self.opt_u64(name, u64::from(min))? {
            None => Ok(None),
            Some(v) => u32::try_from(v)
                .map(Some)
                .map_err(|_| PlanError::value(name, format!("{v} is out of range"))),
        }
    }

    fn u32_or(&mut self, name: &str, min: u32, default: u32) -> PlanResult<u32> {
        Ok(self.opt_u32(name, min)?.unwrap_or(default))
    }

    fn opt_float(&mut self, name: &str) -> PlanResult<Option<f64>> {
        let v = match self.values.remove(name) {
            None => return Ok(None),
            Some(OptionValue::Float(v)) => v,
            Some(OptionValue::Int(v)) => v as f64,
            Some(other) => return Err(mismatch(name, "float", &other)),
        };
        if !v.is_finite() {
            return Err(PlanError::value(name, "must be a finite number"));
        }
        Ok(Some(v))
    }

    fn float_in(&mut self, name: &str, default: f64, range: FloatRange) -> PlanResult<f64> {
        let v = self.opt_float(name)?.unwrap_or(default);
        range.check(name, v)?;
        Ok(v)
    }

    fn opt_string(&mut self, name: &str) -> PlanResult<Option<String>> {
        match self.values.remove(name) {
            None => Ok(None),
            Some(OptionValue::Str(v)) => Ok(Some(v)),
            Some(OptionValue::Path(p)) => Ok(Some(p.to_string_lossy().into_owned())),
            Some(other) => Err(mismatch(name, "string", &other)),
        }
    }

    fn opt_path(&mut self, name: &str) -> PlanResult<Option<PathBuf>> {
        match self.values.remove(name) {
            None => Ok(None),
            Some(OptionValue::Path(p)) => Ok(Some(p)),
            Some(OptionValue::Str(s)) if s.trim().is_empty() => {
                Err(PlanError::value(name, "path must not be empty"))
            }
            Some(OptionValue::Str(s)) => Ok(Some(PathBuf::from(s))),
            Some(other) => Err(mismatch(name, "path", &other)),
        }
    }

    fn opt_int_list(&mut self, name: &str) -> PlanResult<Option<Vec<i64>>> {
        match self.values.remove(name) {
            None => Ok(None),
            Some(OptionValue::IntList(v)) => Ok(Some(v)),
            Some(OptionValue::StrList(v)) if v.is_empty() => Ok(Some(Vec::new())),
            Some(other) => Err(mismatch(name, "list of integers", &other)),
        }
    }

    fn opt_str_list(&mut self, name: &str) -> PlanResult<Option<Vec<String>>> {
        match self.values.remove(name) {
            None => Ok(None),
            Some(OptionValue::StrList(v)) => Ok(Some(v)),
            Some(OptionValue::IntList(v)) if v.is_empty() => Ok(Some(Vec::new())),
            Some(other) => Err(mismatch(name, "list of strings", &other)),
        }
    }

    fn choice<T>(&mut self, name: &str, default: T) -> PlanResult<T>
    where
        T: FromStr<Err = String>,
    {
        match self.opt_string(name)? {
            None => Ok(default),
            Some(s) => s.parse().map_err(|reason| PlanError::value(name, reason)),
        }
    }

    fn finish(self) -> PlanResult<()> {
        match self.values.into_keys().next() {
            Some(option) => Err(PlanError::UnknownOption { option }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FloatRange {
    Positive,
    NonNegative,
    Probability,
    Beta,
}

impl FloatRange {
    fn check(self, name: &str, v: f64) -> PlanResult<()> {
        let ok = match self {
            Self::Positive => v > 0.0,
            Self::NonNegative => v >= 0.0,
            Self::Probability => (0.0..=1.0).contains(&v),
            Self::Beta => (0.0..1.0).contains(&v),
        };
        if ok {
            return Ok(());
        }
        let expected = match self {
            Self::Positive => "a value > 0",
            Self::NonNegative => "a value >= 0",
            Self::Probability => "a value in [0, 1]",
            Self::Beta => "a value in [0, 1)",
        };
        Err(PlanError::value(name, format!("expected {expected}, got {v}")))
    }
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown value `{other}`, expected one of: {}",
                        [$($text),+].join(", ")
                    )),
                }
            }
        }
    };
}

string_enum!(
    /// Bootstrap backend for tensor-parallel communication overlap.
    CommBackend { Nccl => "nccl", Mpi => "mpi", Gloo => "gloo" }
);

string_enum!(
    /// On-disk checkpoint format requested from the engine.
    CheckpointFormat { TorchDist => "torch_dist", Zarr => "zarr" }
);

string_enum!(
    /// How the checkpoint directory is placed under the experiment directory.
    CheckpointLayout { Experiment => "experiment", RunIdentity => "run_identity" }
);

/// Where training data comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSource {
    Mock,
    Dataset { config: PathBuf, dir: Option<PathBuf> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataOptions {
    pub source: DataSource,
    pub eod_pad_in_loss_mask: bool,
    /// `None` keeps the catalog's sequence length.
    pub seq_length: Option<u32>,
    pub workers: u32,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyOptions {
    pub num_nodes: u32,
    pub devices: u32,
    pub tensor_parallel_size: u32,
    pub pipeline_model_parallel_size: u32,
    pub context_parallel_size: u32,
    pub sequence_parallel: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOptions {
    pub micro_batch_size: u32,
    pub global_batch_size: Option<u64>,
    pub grad_acc_batches: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleOptions {
    pub max_steps: u64,
    pub early_stop_on_step: Option<u64>,
    pub constant_steps: u64,
    pub warmup_steps: u64,
    pub lr: f64,
    pub min_lr: f64,
    pub val_check_interval: Option<u64>,
    pub limit_val_batches: u64,
    pub log_every_n_steps: u64,
}

impl ScheduleOptions {
    /// Step budget handed to the trainer and the LR schedule.
    #[must_use]
    pub fn effective_max_steps(&self) -> u64 {
        self.early_stop_on_step.unwrap_or(self.max_steps)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizerOptions {
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_eps: f64,
    pub clip_grad: f64,
    pub use_precision_aware_optimizer: bool,
    pub bf16_main_grads: bool,
    pub average_in_collective: bool,
    pub log_num_zeros_in_grad: bool,
    pub check_for_nan_in_grad: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrecisionOptions {
    pub fp8: bool,
    pub fp8_wgrad: bool,
    pub grad_reduce_in_fp32: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommOptions {
    /// Hardware-targeted tensor-parallel overlap preset requested.
    pub tp_comm_overlap: bool,
    pub backend: CommBackend,
    pub align_param_gather: bool,
    pub overlap_param_gather: bool,
    pub overlap_grad_reduce: bool,
}

/// Activation recomputation mode; the two exclusive flags and the layer
/// count collapse into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ActivationCheckpointing {
    Full { recompute_num_layers: Option<u32> },
    Selective,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelOptions {
    pub model_size: String,
    pub add_bias_output: bool,
    pub hybrid_override_pattern: Option<String>,
    pub num_layers: Option<u32>,
    pub hidden_dropout: f64,
    pub attention_dropout: f64,
    pub use_b2b_causal_conv1d: bool,
    pub activation_checkpointing: ActivationCheckpointing,
    pub cross_entropy_loss_fusion: bool,
    pub fp32_residual_connection: bool,
    pub renormalize_loss: bool,
    pub use_targeted_variance_loss: bool,
    pub spike_no_more_embedding_init: bool,
    pub no_weight_decay_embeddings: bool,
    pub lowercase_loss_weight: Option<f64>,
    pub calculate_per_token_loss: bool,
    pub seq_len_interpolation_factor: Option<f64>,
    /// Raw `key=value` overrides, in the order given.
    pub overrides: Vec<(String, ConfigValue)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraOptions {
    pub checkpoint_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointOptions {
    pub enabled: bool,
    pub restore_path: Option<PathBuf>,
    pub restore_optimizer: bool,
    pub save_top_k: i64,
    pub monitor: String,
    pub save_last: bool,
    pub async_save: bool,
    pub format: CheckpointFormat,
    pub layout: CheckpointLayout,
    pub result_dir: PathBuf,
    pub experiment_name: String,
    pub enable_preemption: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfilingOptions {
    pub enabled: bool,
    pub start_step: u64,
    pub end_step: Option<u64>,
    pub ranks: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsOptions {
    pub gc_interval: u64,
    pub ddp_parity_interval: u64,
    pub log_parameters_and_shapes: bool,
    pub tflops: bool,
    pub profiling: ProfilingOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackingOptions {
    pub tensorboard: bool,
    pub wandb_project: Option<String>,
    pub wandb_entity: Option<String>,
    pub wandb_tags: Vec<String>,
    pub wandb_group: Option<String>,
    pub wandb_job_type: Option<String>,
    pub wandb_run_name: Option<String>,
    pub wandb_id: Option<String>,
    pub wandb_anonymous: bool,
    pub wandb_log_model: bool,
    pub wandb_offline: bool,
}

/// Validated, normalized options. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOptions {
    pub data: DataOptions,
    pub topology: TopologyOptions,
    pub batch: BatchOptions,
    pub schedule: ScheduleOptions,
    pub optimizer: OptimizerOptions,
    pub precision: PrecisionOptions,
    pub comm: CommOptions,
    pub model: ModelOptions,
    pub lora: Option<LoraOptions>,
    pub checkpoint: CheckpointOptions,
    pub diagnostics: DiagnosticsOptions,
    pub tracking: TrackingOptions,
    /// Ask the engine to suppress graph-compilation errors instead of
    /// aborting; consumed once by the engine, never set process-wide.
    pub suppress_compile_errors: bool,
}

impl RunOptions {
    /// Validate and normalize a flat option mapping.
    pub fn from_raw(raw: RawOptions) -> PlanResult<Self> {
        let mut r = OptionReader::new(raw);

        let data = read_data(&mut r)?;
        let topology = read_topology(&mut r)?;
        let batch = read_batch(&mut r)?;
        let schedule = read_schedule(&mut r)?;
        let optimizer = read_optimizer(&mut r)?;
        let precision = PrecisionOptions {
            fp8: r.flag("fp8")?,
            fp8_wgrad: r.flag("fp8_wgrad")?,
            grad_reduce_in_fp32: r.flag("grad_reduce_in_fp32")?,
        };
        let comm = CommOptions {
            tp_comm_overlap: r.flag("use_megatron_comm_overlap_llama3_8k")?,
            backend: r.choice("tp_comm_overlap_backend", CommBackend::Nccl)?,
            align_param_gather: r.flag("align_param_gather")?,
            overlap_param_gather: r.flag("overlap_param_gather")?,
            overlap_grad_reduce: r.flag("overlap_grad_reduce")?,
        };
        let model = read_model(&mut r)?;
        let lora = read_lora(&mut r)?;
        let checkpoint = read_checkpoint(&mut r)?;
        let diagnostics = read_diagnostics(&mut r)?;
        let tracking = read_tracking(&mut r)?;
        let suppress_compile_errors = !r.flag("strict_compile_errors")?;

        r.finish()?;

        Ok(Self {
            data,
            topology,
            batch,
            schedule,
            optimizer,
            precision,
            comm,
            model,
            lora,
            checkpoint,
            diagnostics,
            tracking,
            suppress_compile_errors,
        })
    }

    #[must_use]
    pub fn batch_topology(&self) -> BatchTopology {
        BatchTopology {
            micro_batch_size: u64::from(self.batch.micro_batch_size),
            num_nodes: u64::from(self.topology.num_nodes),
            devices_per_node: u64::from(self.topology.devices),
            tensor_parallel: u64::from(self.topology.tensor_parallel_size),
            pipeline_parallel: u64::from(self.topology.pipeline_model_parallel_size),
            context_parallel: u64::from(self.topology.context_parallel_size),
            grad_accumulation_steps: u64::from(self.batch.grad_acc_batches),
        }
    }

    /// Averaging inside the collective only applies without per-token loss.
    #[must_use]
    pub fn effective_average_in_collective(&self) -> bool {
        self.optimizer.average_in_collective && !self.model.calculate_per_token_loss
    }
}

fn read_data(r: &mut OptionReader) -> PlanResult<DataOptions> {
    let dataset_config = r.opt_path("dataset_config")?;
    let mock_data = r.flag("mock_data")?;
    let dataset_dir = r.opt_path("dataset_dir")?;

    let source = match (dataset_config, mock_data) {
        (Some(_), true) => {
            return Err(PlanError::combination(
                &["dataset_config", "mock_data"],
                "a dataset config and mock data are mutually exclusive",
            ));
        }
        (None, false) => {
            return Err(PlanError::combination(
                &["dataset_config", "mock_data"],
                "either a dataset config or mock data is required",
            ));
        }
        (None, true) if dataset_dir.is_some() => {
            return Err(PlanError::combination(
                &["dataset_dir", "mock_data"],
                "a dataset directory only applies to a dataset config",
            ));
        }
        (None, true) => DataSource::Mock,
        (Some(config), false) => DataSource::Dataset { config, dir: dataset_dir },
    };

    Ok(DataOptions {
        source,
        eod_pad_in_loss_mask: r.flag("eod_pad_in_loss_mask")?,
        seq_length: r.opt_u32("seq_length", 1)?,
        workers: r.u32_or("workers", 0, 8)?,
        seed: r.opt_u64("seed", 0)?.unwrap_or(1234),
    })
}

fn read_topology(r: &mut OptionReader) -> PlanResult<TopologyOptions> {
    Ok(TopologyOptions {
        num_nodes: r.u32_or("num_nodes", 1, 1)?,
        devices: r.u32_or("devices", 1, 1)?,
        tensor_parallel_size: r.u32_or("tensor_parallel_size", 1, 1)?,
        pipeline_model_parallel_size: r.u32_or("pipeline_model_parallel_size", 1, 1)?,
        context_parallel_size: r.u32_or("context_parallel_size", 1, 1)?,
        sequence_parallel: r.flag("sequence_parallel")?,
    })
}

fn read_batch(r: &mut OptionReader) -> PlanResult<BatchOptions> {
    Ok(BatchOptions {
        micro_batch_size: r.u32_or("micro_batch_size", 1, 1)?,
        global_batch_size: r.opt_u64("global_batch_size", 1)?,
        grad_acc_batches: r.u32_or("grad_acc_batches", 1, 1)?,
    })
}

fn read_schedule(r: &mut OptionReader) -> PlanResult<ScheduleOptions> {
    let schedule = ScheduleOptions {
        max_steps: r.opt_u64("max_steps", 1)?.unwrap_or(500_000),
        early_stop_on_step: r.opt_u64("early_stop_on_step", 1)?,
        constant_steps: r.opt_u64("constant_steps", 0)?.unwrap_or(80_000),
        warmup_steps: r.opt_u64("warmup_steps", 0)?.unwrap_or(2_500),
        lr: r.float_in("lr", 3e-4, FloatRange::Positive)?,
        min_lr: r.float_in("min_lr", 3e-5, FloatRange::NonNegative)?,
        val_check_interval: r.opt_u64("val_check_interval", 1)?,
        limit_val_batches: r.opt_u64("limit_val_batches", 0)?.unwrap_or(20),
        log_every_n_steps: r.opt_u64("log_every_n_steps", 1)?.unwrap_or(1),
    };
    if schedule.min_lr > schedule.lr {
        return Err(PlanError::value(
            "min_lr",
            format!("must not exceed lr ({} > {})", schedule.min_lr, schedule.lr),
        ));
    }
    Ok(schedule)
}

fn read_optimizer(r: &mut OptionReader) -> PlanResult<OptimizerOptions> {
    let optimizer = OptimizerOptions {
        weight_decay: r.float_in("wd", 0.01, FloatRange::NonNegative)?,
        adam_beta1: r.float_in("adam_beta1", 0.9, FloatRange::Beta)?,
        adam_beta2: r.float_in("adam_beta2", 0.95, FloatRange::Beta)?,
        adam_eps: r.float_in("adam_eps", 1e-8, FloatRange::Positive)?,
        clip_grad: r.float_in("clip_grad", 1.0, FloatRange::NonNegative)?,
        use_precision_aware_optimizer: r.flag("use_precision_aware_optimizer")?,
        bf16_main_grads: r.flag("bf16_main_grads")?,
        average_in_collective: r.flag("average_in_collective")?,
        log_num_zeros_in_grad: r.flag("log_num_zeros_in_grad")?,
        check_for_nan_in_grad: !r.flag("no_check_for_nan_in_grad")?,
    };
    if optimizer.bf16_main_grads && !optimizer.use_precision_aware_optimizer {
        return Err(PlanError::combination(
            &["bf16_main_grads", "use_precision_aware_optimizer"],
            "bf16 main gradients require the precision-aware optimizer",
        ));
    }
    Ok(optimizer)
}

fn read_model(r: &mut OptionReader) -> PlanResult<ModelOptions> {
    let recompute_num_layers = r.opt_u32("activation_checkpoint_recompute_num_layers", 1)?;
    let disabled = r.flag("no_activation_checkpointing")?;
    let selective = r.flag("selective_activation_checkpointing")?;
    let activation_checkpointing = match (disabled, selective) {
        (true, true) => {
            return Err(PlanError::combination(
                &["no_activation_checkpointing", "selective_activation_checkpointing"],
                "activation checkpointing cannot be both disabled and selective",
            ));
        }
        (true, false) | (false, true) if recompute_num_layers.is_some() => {
            let mode = if disabled {
                "no_activation_checkpointing"
            } else {
                "selective_activation_checkpointing"
            };
            return Err(PlanError::combination(
                &["activation_checkpoint_recompute_num_layers", mode],
                "a recompute layer count only applies to full activation checkpointing",
            ));
        }
        (true, false) => ActivationCheckpointing::Disabled,
        (false, true) => ActivationCheckpointing::Selective,
        (false, false) => ActivationCheckpointing::Full { recompute_num_layers },
    };

    let hybrid_override_pattern = r.opt_string("hybrid_override_pattern")?;
    if hybrid_override_pattern.as_deref().is_some_and(str::is_empty) {
        return Err(PlanError::value("hybrid_override_pattern", "pattern must not be empty"));
    }

    let lowercase_loss_weight = r.opt_float("mamba_lowercase_loss_weight")?;
    if let Some(w) = lowercase_loss_weight {
        FloatRange::Probability.check("mamba_lowercase_loss_weight", w)?;
    }
    let seq_len_interpolation_factor = r.opt_float("seq_len_interpolation_factor")?;
    if let Some(f) = seq_len_interpolation_factor {
        FloatRange::Positive.check("seq_len_interpolation_factor", f)?;
    }

    let overrides = r
        .opt_str_list("model_overrides")?
        .unwrap_or_default()
        .iter()
        .map(|entry| parse_override(entry))
        .collect::<PlanResult<Vec<_>>>()?;

    Ok(ModelOptions {
        model_size: r.opt_string("model_size")?.unwrap_or_else(|| "7b".to_string()),
        add_bias_output: r.flag("add_bias_output")?,
        hybrid_override_pattern,
        num_layers: r.opt_u32("num_layers", 1)?,
        hidden_dropout: r.float_in("hidden_dropout", 0.0, FloatRange::Probability)?,
        attention_dropout: r.float_in("attention_dropout", 0.0, FloatRange::Probability)?,
        use_b2b_causal_conv1d: r.flag("use_b2b_causal_conv1d")?,
        activation_checkpointing,
        cross_entropy_loss_fusion: r.flag("cross_entropy_loss_fusion")?,
        fp32_residual_connection: !r.flag("no_fp32_residual_connection")?,
        renormalize_loss: !r.flag("no_renormalize_loss")?,
        use_targeted_variance_loss: r.flag("use_targeted_variance_loss")?,
        spike_no_more_embedding_init: r.flag("spike_no_more_embedding_init")?,
        no_weight_decay_embeddings: r.flag("no_weight_decay_embeddings")?,
        lowercase_loss_weight,
        calculate_per_token_loss: !r.flag("no_calculate_per_token_loss")?,
        seq_len_interpolation_factor,
        overrides,
    })
}

fn parse_override(entry: &str) -> PlanResult<(String, ConfigValue)> {
    let Some((key, value)) = entry.split_once('=') else {
        return Err(PlanError::value("model_overrides", format!("`{entry}` is not of the form key=value")));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(PlanError::value("model_overrides", format!("`{entry}` has an empty key")));
    }
    Ok((key.to_string(), ConfigValue::parse_literal(value.trim())))
}

fn read_lora(r: &mut OptionReader) -> PlanResult<Option<LoraOptions>> {
    let enabled = r.flag("lora_finetune")?;
    let checkpoint_path = r.opt_path("lora_checkpoint_path")?;
    match (enabled, checkpoint_path) {
        (true, checkpoint_path) => Ok(Some(LoraOptions { checkpoint_path })),
        (false, None) => Ok(None),
        (false, Some(_)) => Err(PlanError::combination(
            &["lora_checkpoint_path", "lora_finetune"],
            "a LoRA checkpoint requires LoRA fine-tuning",
        )),
    }
}

fn read_checkpoint(r: &mut OptionReader) -> PlanResult<CheckpointOptions> {
    let enabled = !r.flag("disable_checkpointing")?;
    let restore_path = r.opt_path("ckpt_dir")?;
    let restore_optimizer = r.flag("restore_optimizer_from_ckpt")?;

    if !enabled && restore_path.is_some() {
        return Err(PlanError::combination(
            &["ckpt_dir", "disable_checkpointing"],
            "a restore checkpoint needs checkpointing enabled",
        ));
    }
    if restore_optimizer && restore_path.is_none() {
        return Err(PlanError::combination(
            &["restore_optimizer_from_ckpt", "ckpt_dir"],
            "restoring optimizer state requires a restore checkpoint",
        ));
    }

    let save_top_k = r.opt_int("save_top_k")?.unwrap_or(5);
    if save_top_k < -1 {
        return Err(PlanError::value("save_top_k", format!("must be >= -1, got {save_top_k}")));
    }

    let experiment_name = r.opt_string("experiment_name")?.unwrap_or_else(|| "evo2".to_string());
    if experiment_name.trim().is_empty() || experiment_name.contains(['/', '\\']) || experiment_name == ".." {
        return Err(PlanError::value(
            "experiment_name",
            "must be a non-empty name without path separators",
        ));
    }

    Ok(CheckpointOptions {
        enabled,
        restore_path,
        restore_optimizer,
        save_top_k,
        monitor: r
            .opt_string("metric_to_monitor_for_checkpoints")?
            .unwrap_or_else(|| "val_loss".to_string()),
        save_last: !r.flag("no_save_last_checkpoint")?,
        async_save: r.flag("ckpt_async_save")?,
        format: r.choice("ckpt_format", CheckpointFormat::TorchDist)?,
        layout: r.choice("checkpoint_layout", CheckpointLayout::Experiment)?,
        result_dir: r.opt_path("result_dir")?.unwrap_or_else(|| PathBuf::from("./results")),
        experiment_name,
        enable_preemption: r.flag("enable_preemption")?,
    })
}

fn read_diagnostics(r: &mut OptionReader) -> PlanResult<DiagnosticsOptions> {
    let start_step = r.opt_u64("nsys_start_step", 0)?.unwrap_or(0);
    let end_step = r.opt_u64("nsys_end_step", 0)?;
    if let Some(end) = end_step {
        if end < start_step {
            return Err(PlanError::value(
                "nsys_end_step",
                format!("must not precede nsys_start_step ({end} < {start_step})"),
            ));
        }
    }

    let ranks = match r.opt_int_list("nsys_ranks")? {
        None => vec![0],
        Some(ranks) if ranks.is_empty() => {
            return Err(PlanError::value("nsys_ranks", "at least one rank is required"));
        }
        Some(ranks) => ranks
            .into_iter()
            .map(|rank| {
                u32::try_from(rank)
                    .map_err(|_| PlanError::value("nsys_ranks", format!("invalid rank {rank}")))
            })
            .collect::<PlanResult<Vec<_>>>()?,
    };

    Ok(DiagnosticsOptions {
        gc_interval: r.opt_u64("gc_interval", 0)?.unwrap_or(0),
        ddp_parity_interval: r.opt_u64("debug_ddp_parity_freq", 0)?.unwrap_or(0),
        log_parameters_and_shapes: r.flag("log_parameters_and_shapes")?,
        tflops: r.flag("create_tflops_callback")?,
        profiling: ProfilingOptions { enabled: r.flag("nsys_profiling")?, start_step, end_step, ranks },
    })
}

fn read_tracking(r: &mut OptionReader) -> PlanResult<TrackingOptions> {
    Ok(TrackingOptions {
        tensorboard: r.flag("create_tensorboard_logger")?,
        wandb_project: r.opt_string("wandb_project")?,
        wandb_entity: r.opt_string("wandb_entity")?,
        wandb_tags: r.opt_str_list("wandb_tags")?.unwrap_or_default(),
        wandb_group: r.opt_string("wandb_group")?,
        wandb_job_type: r.opt_string("wandb_job_type")?,
        wandb_run_name: r.opt_string("wandb_run_name")?,
        wandb_id: r.opt_string("wandb_id")?,
        wandb_anonymous: r.flag("wandb_anonymous")?,
        wandb_log_model: r.flag("wandb_log_model")?,
        wandb_offline: r.flag("wandb_offline")?,
    })
}
