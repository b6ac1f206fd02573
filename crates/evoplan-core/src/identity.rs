//! Run identity: a deterministic label built from a fixed, versioned list of
//! rules, each contributing `-<LABEL><value>` or nothing.

use crate::architecture::{ArchitectureSpec, ConfigValue};
use crate::catalog::ArchitectureFamily;
use crate::options::{ActivationCheckpointing, RunOptions};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Bumped whenever a rule is added, removed, reordered or re-rendered.
pub const IDENTITY_FORMAT_VERSION: u32 = 2;

const PREFIX: &str = "evo2-size-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RunIdentity {
    label: String,
    digest: String,
    version: u32,
}

impl RunIdentity {
    fn from_label(label: String) -> Self {
        let digest = hex::encode(Sha256::digest(label.as_bytes()));
        Self { label, digest, version: IDENTITY_FORMAT_VERSION }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.label
    }

    /// Hex SHA-256 of the label.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    #[must_use]
    pub fn short_digest(&self) -> &str {
        &self.digest[..16]
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Shortest round-trip decimal, never in exponent form, always with a
/// fractional part.
#[must_use]
pub fn render_float(v: f64) -> String {
    let text = v.to_string();
    if text.contains('.') || !v.is_finite() {
        text
    } else {
        format!("{text}.0")
    }
}

fn flag(v: bool) -> Option<String> {
    Some(if v { "True" } else { "False" }.to_string())
}

fn int(v: impl Into<u64>) -> Option<String> {
    Some(v.into().to_string())
}

fn float(v: f64) -> Option<String> {
    Some(render_float(v))
}

fn setting(arch: &ArchitectureSpec, key: &str) -> Option<String> {
    Some(arch.setting(key).unwrap_or(&ConfigValue::Null).to_string())
}

struct IdentityInputs<'a> {
    options: &'a RunOptions,
    global_batch_size: u64,
    arch: &'a ArchitectureSpec,
}

struct IdentityRule {
    label: &'static str,
    render: fn(&IdentityInputs<'_>) -> Option<String>,
}

const fn rule(label: &'static str, render: fn(&IdentityInputs<'_>) -> Option<String>) -> IdentityRule {
    IdentityRule { label, render }
}

const RULES: &[IdentityRule] = &[
    rule("TP", |i| int(i.options.topology.tensor_parallel_size)),
    rule("PP", |i| int(i.options.topology.pipeline_model_parallel_size)),
    rule("CP", |i| int(i.options.topology.context_parallel_size)),
    rule("GBS", |i| int(i.global_batch_size)),
    rule("MBS", |i| int(i.options.batch.micro_batch_size)),
    rule("SkipLossRenorm", |i| flag(!i.options.model.renormalize_loss)),
    rule("NOAC", |i| {
        flag(i.options.model.activation_checkpointing == ActivationCheckpointing::Disabled)
    }),
    rule("SELAC", |i| {
        flag(i.options.model.activation_checkpointing == ActivationCheckpointing::Selective)
    }),
    rule("ACRNL", |i| setting(i.arch, "recompute_num_layers")),
    rule("PAT", |i| Some(i.arch.pattern().to_string())),
    rule("F32R", |i| setting(i.arch, "fp32_residual_connection")),
    rule("FCE", |i| setting(i.arch, "cross_entropy_loss_fusion")),
    rule("AIC", |i| flag(i.options.effective_average_in_collective())),
    rule("PTL", |i| flag(i.options.model.calculate_per_token_loss)),
    rule("PEOD", |i| flag(i.options.data.eod_pad_in_loss_mask)),
    rule("BO", |i| flag(i.options.model.add_bias_output)),
    rule("GCLP", |i| float(i.options.optimizer.clip_grad)),
    rule("HDO", |i| float(i.options.model.hidden_dropout)),
    rule("ADO", |i| float(i.options.model.attention_dropout)),
    rule("LR", |i| float(i.options.schedule.lr)),
    rule("MINLR", |i| float(i.options.schedule.min_lr)),
    rule("WUSTEPS", |i| int(i.options.schedule.warmup_steps)),
    rule("CONSTSTEPS", |i| int(i.options.schedule.constant_steps)),
    rule("WD", |i| float(i.options.optimizer.weight_decay)),
    rule("GRFP32", |i| flag(i.options.precision.grad_reduce_in_fp32)),
    rule("FP8WG", |i| {
        let precision = &i.options.precision;
        flag(precision.fp8 && (precision.fp8_wgrad || i.options.comm.tp_comm_overlap))
    }),
    rule("B1", |i| float(i.options.optimizer.adam_beta1)),
    rule("B2", |i| float(i.options.optimizer.adam_beta2)),
    rule("EPS", |i| float(i.options.optimizer.adam_eps)),
    rule("PAO", |i| flag(i.options.optimizer.use_precision_aware_optimizer)),
    rule("B16MG", |i| flag(i.options.optimizer.bf16_main_grads)),
    rule("EWD", |i| flag(i.options.model.no_weight_decay_embeddings)),
    rule("SNI", |i| flag(i.options.model.spike_no_more_embedding_init)),
    rule("OGR", |i| flag(i.options.comm.overlap_grad_reduce)),
    rule("OPG", |i| flag(i.options.comm.overlap_param_gather)),
    rule("TVL", |i| flag(i.options.model.use_targeted_variance_loss)),
    rule("NODES", |i| int(i.options.topology.num_nodes)),
    rule("FP8", |i| flag(i.options.precision.fp8)),
    rule("DEV", |i| int(i.options.topology.devices)),
    rule("SP", |i| flag(i.options.topology.sequence_parallel)),
    rule("SEQ", |i| int(i.arch.seq_length())),
    rule("NL", |i| int(i.arch.num_layers())),
    rule("STEPS", |i| int(i.options.schedule.effective_max_steps())),
    rule("SEED", |i| int(i.options.data.seed)),
    rule("LORA", |i| flag(i.options.lora.is_some())),
    rule("B2B", |i| {
        if i.arch.family() != ArchitectureFamily::Hyena {
            return None;
        }
        let on = i.arch.setting("use_b2b_causal_conv1d").and_then(ConfigValue::as_bool);
        flag(on.unwrap_or(false))
    }),
    rule("LLW", |i| {
        (i.arch.family() == ArchitectureFamily::Mamba)
            .then(|| setting(i.arch, "lowercase_loss_reweighting"))
            .flatten()
    }),
    rule("SLIF", |i| match i.arch.setting("seq_len_interpolation_factor") {
        None | Some(ConfigValue::Null) => None,
        Some(value) => Some(value.to_string()),
    }),
    rule("OVR", |i| {
        let overrides: BTreeMap<&str, &ConfigValue> =
            i.options.model.overrides.iter().map(|(k, v)| (k.as_str(), v)).collect();
        if overrides.is_empty() {
            return None;
        }
        let rendered: Vec<String> = overrides.iter().map(|(k, v)| format!("{k}={v}")).collect();
        Some(rendered.join(","))
    }),
];

/// Labels in rule order; part of the identity format contract.
pub fn rule_labels() -> impl Iterator<Item = &'static str> {
    RULES.iter().map(|r| r.label)
}

/// Derive the run identity. Pure: equal inputs give byte-identical output.
#[must_use]
pub fn generate(options: &RunOptions, global_batch_size: u64, arch: &ArchitectureSpec) -> RunIdentity {
    let inputs = IdentityInputs { options, global_batch_size, arch };

    let mut label = format!("{PREFIX}{}", options.model.model_size);
    for rule in RULES {
        if let Some(value) = (rule.render)(&inputs) {
            label.push('-');
            label.push_str(rule.label);
            label.push_str(&value);
        }
    }

    let identity = RunIdentity::from_label(label);
    debug!(digest = identity.short_digest(), "generated run identity");
    identity
}
