//! Architecture selection.
//!
//! A size identifier picks a family from the catalog; the family's builder
//! then checks every override key and value, applies its exclusivity rules,
//! merges the overrides onto the catalog defaults and finally fills in the
//! derived defaults for keys nobody set explicitly.

use crate::catalog::{ArchitectureFamily, BaseHyperparameters, Catalog};
use crate::error::{PlanError, PlanResult};
use crate::identity::render_float;
use crate::options::{ActivationCheckpointing, RunOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Value of a single architecture setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ConfigValue {
    /// Parse the right-hand side of a `key=value` override.
    #[must_use]
    pub fn parse_literal(text: &str) -> Self {
        match text {
            "None" | "null" => return Self::Null,
            "true" | "True" => return Self::Bool(true),
            "false" | "False" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(v) = text.parse::<i64>() {
            return Self::Int(v);
        }
        if let Ok(v) = text.parse::<f64>() {
            if v.is_finite() {
                return Self::Float(v);
            }
        }
        Self::Str(text.trim_matches(|c| c == '"' || c == '\'').to_string())
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Floats, with integers widened.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => f.write_str(&render_float(*v)),
            Self::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u32> for ConfigValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Flag,
    /// Integer >= 1.
    Count,
    /// Float in [0, 1].
    Probability,
    /// Float > 0.
    Positive,
    Choice(&'static [&'static str]),
    Pattern,
}

impl ValueKind {
    fn describe(self) -> String {
        match self {
            Self::Flag => "a boolean".to_string(),
            Self::Count => "an integer >= 1".to_string(),
            Self::Probability => "a number in [0, 1]".to_string(),
            Self::Positive => "a number > 0".to_string(),
            Self::Choice(choices) => format!("one of: {}", choices.join(", ")),
            Self::Pattern => "a non-empty layer pattern".to_string(),
        }
    }
}

/// An override key a family accepts, with the shape of its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverrideKey {
    pub name: &'static str,
    pub kind: ValueKind,
    pub nullable: bool,
}

impl OverrideKey {
    const fn new(name: &'static str, kind: ValueKind) -> Self {
        Self { name, kind, nullable: false }
    }

    const fn nullable(name: &'static str, kind: ValueKind) -> Self {
        Self { name, kind, nullable: true }
    }

    /// Type-check `value` and return it in canonical form.
    fn normalize(&self, family: ArchitectureFamily, value: &ConfigValue) -> PlanResult<ConfigValue> {
        let invalid = |reason: String| PlanError::InvalidOverrideValue {
            family: family.to_string(),
            key: self.name.to_string(),
            reason,
        };

        if *value == ConfigValue::Null {
            return if self.nullable {
                Ok(ConfigValue::Null)
            } else {
                Err(invalid("must not be None".to_string()))
            };
        }

        let normalized = match self.kind {
            ValueKind::Flag => value.as_bool().map(ConfigValue::Bool),
            ValueKind::Count => value.as_int().filter(|n| *n >= 1).map(ConfigValue::Int),
            ValueKind::Probability => value
                .as_float()
                .filter(|v| (0.0..=1.0).contains(v))
                .map(ConfigValue::Float),
            ValueKind::Positive => value.as_float().filter(|v| *v > 0.0).map(ConfigValue::Float),
            ValueKind::Choice(choices) => value
                .as_str()
                .filter(|s| choices.contains(s))
                .map(|s| ConfigValue::Str(s.to_string())),
            ValueKind::Pattern => value
                .as_str()
                .filter(|s| !s.is_empty())
                .map(|s| ConfigValue::Str(s.to_string())),
        };

        normalized.ok_or_else(|| invalid(format!("expected {}, got `{value}`", self.kind.describe())))
    }
}

const RECOMPUTE_GRANULARITY: &[&str] = &["full", "selective"];
const RECOMPUTE_METHOD: &[&str] = &["uniform", "block"];
const LOSS_WEIGHTING: &[&str] = &["weighted", "normalized_weighted"];

/// Override keys every family accepts.
pub const COMMON_KEYS: &[OverrideKey] = &[
    OverrideKey::new("num_layers", ValueKind::Count),
    OverrideKey::new("seq_length", ValueKind::Count),
    OverrideKey::new("hybrid_override_pattern", ValueKind::Pattern),
    OverrideKey::new("hidden_dropout", ValueKind::Probability),
    OverrideKey::new("attention_dropout", ValueKind::Probability),
    OverrideKey::new("calculate_per_token_loss", ValueKind::Flag),
    OverrideKey::new("tp_comm_overlap", ValueKind::Flag),
    OverrideKey::new("cross_entropy_loss_fusion", ValueKind::Flag),
    OverrideKey::new("fp32_residual_connection", ValueKind::Flag),
    OverrideKey::new("add_bias_output", ValueKind::Flag),
    OverrideKey::new("to_upper", ValueKind::Choice(LOSS_WEIGHTING)),
    OverrideKey::new("distribute_saved_activations", ValueKind::Flag),
    OverrideKey::new("use_targeted_variance_loss", ValueKind::Flag),
    OverrideKey::nullable("recompute_granularity", ValueKind::Choice(RECOMPUTE_GRANULARITY)),
    OverrideKey::nullable("recompute_method", ValueKind::Choice(RECOMPUTE_METHOD)),
    OverrideKey::nullable("recompute_num_layers", ValueKind::Count),
    OverrideKey::nullable("seq_len_interpolation_factor", ValueKind::Positive),
    OverrideKey::new("sequence_parallel", ValueKind::Flag),
];

const HYENA_KEYS: &[OverrideKey] = &[OverrideKey::new("use_b2b_causal_conv1d", ValueKind::Flag)];

const MAMBA_KEYS: &[OverrideKey] = &[
    OverrideKey::new("lowercase_loss_reweighting", ValueKind::Probability),
    OverrideKey::new("spike_no_more_embedding_init", ValueKind::Flag),
    OverrideKey::new("no_weight_decay_embeddings", ValueKind::Flag),
];

/// Run options that feed derived defaults without being overrides themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DerivationContext {
    pub renormalize_loss: bool,
    pub activation_checkpointing: ActivationCheckpointing,
    pub lora_finetune: bool,
}

impl Default for DerivationContext {
    fn default() -> Self {
        Self {
            renormalize_loss: true,
            activation_checkpointing: ActivationCheckpointing::Full { recompute_num_layers: None },
            lora_finetune: false,
        }
    }
}

/// Explicit override values keyed by setting name, plus the derivation context.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelOverrides {
    values: BTreeMap<String, ConfigValue>,
    context: DerivationContext,
}

impl ModelOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: DerivationContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigValue)> {
        self.values.iter()
    }

    #[must_use]
    pub fn context(&self) -> &DerivationContext {
        &self.context
    }

    /// Collect the architecture overrides implied by `options`.
    ///
    /// Plain flags are always emitted; optional settings only when given.
    /// A raw `model_overrides` entry may not name a setting that has its own
    /// option, since the rest of the plan reads that option.
    pub fn from_options(options: &RunOptions) -> PlanResult<Self> {
        let model = &options.model;

        // (setting, option it came from, value)
        let direct: Vec<(&str, &str, Option<ConfigValue>)> = vec![
            (
                "calculate_per_token_loss",
                "no_calculate_per_token_loss",
                Some(model.calculate_per_token_loss.into()),
            ),
            (
                "tp_comm_overlap",
                "use_megatron_comm_overlap_llama3_8k",
                Some(options.comm.tp_comm_overlap.into()),
            ),
            ("hidden_dropout", "hidden_dropout", Some(model.hidden_dropout.into())),
            ("attention_dropout", "attention_dropout", Some(model.attention_dropout.into())),
            (
                "cross_entropy_loss_fusion",
                "cross_entropy_loss_fusion",
                Some(model.cross_entropy_loss_fusion.into()),
            ),
            (
                "fp32_residual_connection",
                "no_fp32_residual_connection",
                Some(model.fp32_residual_connection.into()),
            ),
            ("add_bias_output", "add_bias_output", Some(model.add_bias_output.into())),
            ("sequence_parallel", "sequence_parallel", Some(options.topology.sequence_parallel.into())),
            ("num_layers", "num_layers", model.num_layers.map(ConfigValue::from)),
            ("seq_length", "seq_length", options.data.seq_length.map(ConfigValue::from)),
            (
                "hybrid_override_pattern",
                "hybrid_override_pattern",
                model.hybrid_override_pattern.as_deref().map(ConfigValue::from),
            ),
            (
                "use_targeted_variance_loss",
                "use_targeted_variance_loss",
                model.use_targeted_variance_loss.then_some(ConfigValue::Bool(true)),
            ),
            (
                "seq_len_interpolation_factor",
                "seq_len_interpolation_factor",
                model.seq_len_interpolation_factor.map(ConfigValue::from),
            ),
            (
                "recompute_num_layers",
                "activation_checkpoint_recompute_num_layers",
                match model.activation_checkpointing {
                    ActivationCheckpointing::Full { recompute_num_layers: Some(n) } => Some(n.into()),
                    _ => None,
                },
            ),
            (
                "use_b2b_causal_conv1d",
                "use_b2b_causal_conv1d",
                model.use_b2b_causal_conv1d.then_some(ConfigValue::Bool(true)),
            ),
            (
                "spike_no_more_embedding_init",
                "spike_no_more_embedding_init",
                model.spike_no_more_embedding_init.then_some(ConfigValue::Bool(true)),
            ),
            (
                "no_weight_decay_embeddings",
                "no_weight_decay_embeddings",
                model.no_weight_decay_embeddings.then_some(ConfigValue::Bool(true)),
            ),
            (
                "lowercase_loss_reweighting",
                "mamba_lowercase_loss_weight",
                model.lowercase_loss_weight.map(ConfigValue::from),
            ),
        ];

        for (key, _) in &model.overrides {
            if let Some((_, option, _)) = direct.iter().find(|(k, _, _)| *k == key.as_str()) {
                return Err(PlanError::combination(
                    &[*option, "model_overrides"],
                    format!("`{key}` has a dedicated option; set it with `{option}` instead"),
                ));
            }
        }

        let mut values: BTreeMap<String, ConfigValue> = direct
            .into_iter()
            .filter_map(|(key, _, value)| value.map(|v| (key.to_string(), v)))
            .collect();
        for (key, value) in &model.overrides {
            values.insert(key.clone(), value.clone());
        }

        Ok(Self {
            values,
            context: DerivationContext {
                renormalize_loss: model.renormalize_loss,
                activation_checkpointing: model.activation_checkpointing,
                lora_finetune: options.lora.is_some(),
            },
        })
    }
}

/// Capability interface shared by every architecture family.
pub trait FamilyBuilder: Sync {
    fn family(&self) -> ArchitectureFamily;

    /// Override keys accepted only by this family.
    fn family_keys(&self) -> &'static [OverrideKey];

    fn pattern_symbols(&self) -> &'static [char];

    fn supports_lora(&self) -> bool {
        true
    }

    /// Family exclusivity rules over the checked overrides.
    fn check_features(&self, _overrides: &BTreeMap<String, ConfigValue>) -> PlanResult<()> {
        Ok(())
    }

    /// Family-specific derived defaults; must only fill absent keys.
    fn derive_defaults(&self, _settings: &mut BTreeMap<String, ConfigValue>) {}

    fn override_key(&self, name: &str) -> Option<&'static OverrideKey> {
        COMMON_KEYS.iter().chain(self.family_keys()).find(|k| k.name == name)
    }

    fn build(
        &self,
        size_identifier: &str,
        base: &BaseHyperparameters,
        overrides: &ModelOverrides,
    ) -> PlanResult<ArchitectureSpec> {
        let family = self.family();

        let mut applied = BTreeMap::new();
        for (key, value) in overrides.iter() {
            let Some(spec) = self.override_key(key) else {
                return Err(PlanError::InvalidOverrideForFamily { family: family.to_string(), key: key.clone() });
            };
            applied.insert(key.clone(), spec.normalize(family, value)?);
        }

        if overrides.context().lora_finetune && !self.supports_lora() {
            return Err(PlanError::UnsupportedFeatureForFamily {
                family: family.to_string(),
                feature: "lora_finetune".to_string(),
            });
        }
        self.check_features(&applied)?;

        let mut settings = base_settings(base);
        settings.extend(applied.iter().map(|(k, v)| (k.clone(), v.clone())));
        derive_common_defaults(&mut settings, base, overrides.context());
        self.derive_defaults(&mut settings);

        let spec = ArchitectureSpec {
            family,
            size_identifier: size_identifier.to_string(),
            base: *base,
            overrides: applied,
            settings,
        };
        spec.validate(self.pattern_symbols())?;
        Ok(spec)
    }
}

pub struct HyenaBuilder;

impl FamilyBuilder for HyenaBuilder {
    fn family(&self) -> ArchitectureFamily {
        ArchitectureFamily::Hyena
    }

    fn family_keys(&self) -> &'static [OverrideKey] {
        HYENA_KEYS
    }

    fn pattern_symbols(&self) -> &'static [char] {
        &['S', 'D', 'H', '*']
    }
}

pub struct MambaBuilder;

impl FamilyBuilder for MambaBuilder {
    fn family(&self) -> ArchitectureFamily {
        ArchitectureFamily::Mamba
    }

    fn family_keys(&self) -> &'static [OverrideKey] {
        MAMBA_KEYS
    }

    fn pattern_symbols(&self) -> &'static [char] {
        &['M', '-', '*']
    }

    fn supports_lora(&self) -> bool {
        false
    }

    fn check_features(&self, overrides: &BTreeMap<String, ConfigValue>) -> PlanResult<()> {
        if overrides.get("add_bias_output") == Some(&ConfigValue::Bool(true)) {
            return Err(PlanError::UnsupportedFeatureForFamily {
                family: self.family().to_string(),
                feature: "add_bias_output".to_string(),
            });
        }
        Ok(())
    }

    fn derive_defaults(&self, settings: &mut BTreeMap<String, ConfigValue>) {
        settings
            .entry("lowercase_loss_reweighting".to_string())
            .or_insert(ConfigValue::Float(0.1));
    }
}

impl ArchitectureFamily {
    #[must_use]
    pub fn builder(self) -> &'static dyn FamilyBuilder {
        match self {
            Self::Hyena => &HyenaBuilder,
            Self::Mamba => &MambaBuilder,
        }
    }
}

fn base_settings(base: &BaseHyperparameters) -> BTreeMap<String, ConfigValue> {
    [
        ("num_layers", ConfigValue::from(base.num_layers)),
        ("hidden_size", ConfigValue::from(base.hidden_size)),
        ("ffn_hidden_size", ConfigValue::from(base.ffn_hidden_size)),
        ("num_attention_heads", ConfigValue::from(base.num_attention_heads)),
        ("seq_length", ConfigValue::from(base.seq_length)),
        ("vocab_size", ConfigValue::from(base.vocab_size)),
        ("hybrid_override_pattern", ConfigValue::from(base.hybrid_override_pattern)),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect()
}

fn derive_common_defaults(
    settings: &mut BTreeMap<String, ConfigValue>,
    base: &BaseHyperparameters,
    context: &DerivationContext,
) {
    let to_upper = if context.renormalize_loss { "normalized_weighted" } else { "weighted" };
    settings.entry("to_upper".to_string()).or_insert_with(|| to_upper.into());

    let sequence_parallel = settings
        .get("sequence_parallel")
        .and_then(ConfigValue::as_bool)
        .unwrap_or(false);
    settings
        .entry("distribute_saved_activations".to_string())
        .or_insert(ConfigValue::Bool(!sequence_parallel));

    let (granularity, method, layers) = match context.activation_checkpointing {
        ActivationCheckpointing::Disabled => (ConfigValue::Null, ConfigValue::Null, ConfigValue::Null),
        ActivationCheckpointing::Selective => ("selective".into(), ConfigValue::Null, ConfigValue::Null),
        ActivationCheckpointing::Full { recompute_num_layers } => (
            "full".into(),
            "uniform".into(),
            recompute_num_layers.unwrap_or(base.recompute_num_layers).into(),
        ),
    };
    settings.entry("recompute_granularity".to_string()).or_insert(granularity);
    settings.entry("recompute_method".to_string()).or_insert(method);
    settings.entry("recompute_num_layers".to_string()).or_insert(layers);
}

/// Resolved model configuration handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchitectureSpec {
    family: ArchitectureFamily,
    size_identifier: String,
    base: BaseHyperparameters,
    overrides: BTreeMap<String, ConfigValue>,
    settings: BTreeMap<String, ConfigValue>,
}

impl ArchitectureSpec {
    #[must_use]
    pub fn family(&self) -> ArchitectureFamily {
        self.family
    }

    #[must_use]
    pub fn size_identifier(&self) -> &str {
        &self.size_identifier
    }

    #[must_use]
    pub fn base(&self) -> &BaseHyperparameters {
        &self.base
    }

    /// Checked override values, as applied on top of the catalog defaults.
    #[must_use]
    pub fn overrides(&self) -> &BTreeMap<String, ConfigValue> {
        &self.overrides
    }

    /// Final settings: catalog defaults, overrides and derived defaults.
    #[must_use]
    pub fn settings(&self) -> &BTreeMap<String, ConfigValue> {
        &self.settings
    }

    #[must_use]
    pub fn setting(&self, key: &str) -> Option<&ConfigValue> {
        self.settings.get(key)
    }

    #[must_use]
    pub fn num_layers(&self) -> u32 {
        self.setting("num_layers")
            .and_then(ConfigValue::as_int)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(self.base.num_layers)
    }

    #[must_use]
    pub fn seq_length(&self) -> u32 {
        self.setting("seq_length")
            .and_then(ConfigValue::as_int)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(self.base.seq_length)
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        self.setting("hybrid_override_pattern")
            .and_then(ConfigValue::as_str)
            .unwrap_or(self.base.hybrid_override_pattern)
    }

    fn validate(&self, symbols: &[char]) -> PlanResult<()> {
        let invalid = |key: &str, reason: String| PlanError::InvalidOverrideValue {
            family: self.family.to_string(),
            key: key.to_string(),
            reason,
        };

        let pattern = self.pattern();
        if let Some(bad) = pattern.chars().find(|c| !symbols.contains(c)) {
            let allowed: String = symbols.iter().collect();
            return Err(invalid(
                "hybrid_override_pattern",
                format!("`{bad}` is not a {} layer symbol (allowed: {allowed})", self.family),
            ));
        }

        let num_layers = self.num_layers();
        let pattern_layers = pattern.chars().count();
        if pattern_layers != num_layers as usize {
            return Err(invalid(
                "hybrid_override_pattern",
                format!("pattern describes {pattern_layers} layers but num_layers is {num_layers}"),
            ));
        }

        if let Some(n) = self.setting("recompute_num_layers").and_then(ConfigValue::as_int) {
            if n > i64::from(num_layers) {
                return Err(invalid(
                    "recompute_num_layers",
                    format!("{n} exceeds the {num_layers} layers of the model"),
                ));
            }
        }

        Ok(())
    }
}

/// Look up `size_identifier` and build its architecture with `overrides`.
pub fn select(catalog: &Catalog, size_identifier: &str, overrides: &ModelOverrides) -> PlanResult<ArchitectureSpec> {
    let entry = catalog.lookup(size_identifier)?;
    debug!(size = size_identifier, family = %entry.family, "selected architecture family");
    entry.family.builder().build(entry.size, &entry.defaults, overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select_builtin(size: &str, overrides: &ModelOverrides) -> PlanResult<ArchitectureSpec> {
        select(&Catalog::builtin(), size, overrides)
    }

    #[test]
    fn test_defaults_come_from_catalog() {
        let spec = select_builtin("7b", &ModelOverrides::new()).unwrap();
        assert_eq!(spec.family(), ArchitectureFamily::Hyena);
        assert_eq!(spec.num_layers(), 32);
        assert_eq!(spec.seq_length(), 8192);
        assert_eq!(spec.setting("recompute_num_layers"), Some(&ConfigValue::Int(4)));
        assert_eq!(spec.setting("recompute_granularity"), Some(&ConfigValue::from("full")));
        assert_eq!(spec.setting("to_upper"), Some(&ConfigValue::from("normalized_weighted")));
        assert_eq!(spec.setting("distribute_saved_activations"), Some(&ConfigValue::Bool(true)));
    }

    fn overrides_from(entries: &[&str]) -> PlanResult<ModelOverrides> {
        let raw = crate::options::RawOptions::new()
            .with("mock_data", true)
            .with("model_overrides", entries.iter().map(|e| (*e).to_string()).collect::<Vec<_>>());
        ModelOverrides::from_options(&RunOptions::from_raw(raw)?)
    }

    #[test]
    fn test_raw_override_of_dedicated_option_is_rejected() {
        for (entry, option) in [
            ("sequence_parallel=true", "sequence_parallel"),
            ("tp_comm_overlap=true", "use_megatron_comm_overlap_llama3_8k"),
            ("calculate_per_token_loss=false", "no_calculate_per_token_loss"),
            ("hidden_dropout=0.1", "hidden_dropout"),
            ("use_targeted_variance_loss=true", "use_targeted_variance_loss"),
            ("num_layers=4", "num_layers"),
        ] {
            let err = overrides_from(&[entry]).unwrap_err();
            assert_eq!(err.kind(), "InvalidOptionCombination", "{entry}");
            assert_eq!(err.options(), vec![option.to_string(), "model_overrides".to_string()], "{entry}");
        }
    }

    #[test]
    fn test_raw_override_of_derived_setting_is_kept() {
        let overrides = overrides_from(&["recompute_method=block", "to_upper=weighted"]).unwrap();
        let spec = select_builtin("7b", &overrides).unwrap();
        assert_eq!(spec.setting("recompute_method"), Some(&ConfigValue::from("block")));
        assert_eq!(spec.setting("to_upper"), Some(&ConfigValue::from("weighted")));
        assert_eq!(spec.setting("sequence_parallel"), Some(&ConfigValue::Bool(false)));
    }

    #[test]
    fn test_foreign_key_is_rejected() {
        let overrides = ModelOverrides::new().with("use_b2b_causal_conv1d", true);
        let err = select_builtin("hybrid_mamba_8b", &overrides).unwrap_err();
        assert!(matches!(
            err,
            PlanError::InvalidOverrideForFamily { ref family, ref key } if family == "mamba" && key == "use_b2b_causal_conv1d"
        ));

        let overrides = ModelOverrides::new().with("lowercase_loss_reweighting", 0.5);
        assert!(select_builtin("7b", &overrides).is_err());
    }

    #[test]
    fn test_output_bias_forbidden_for_mamba() {
        let overrides = ModelOverrides::new().with("add_bias_output", true);
        let err = select_builtin("hybrid_mamba_test", &overrides).unwrap_err();
        assert_eq!(err.kind(), "UnsupportedFeatureForFamily");

        assert!(select_builtin("test", &overrides).is_ok());
        let off = ModelOverrides::new().with("add_bias_output", false);
        assert!(select_builtin("hybrid_mamba_test", &off).is_ok());
    }

    #[test]
    fn test_lora_unsupported_for_mamba() {
        let context = DerivationContext { lora_finetune: true, ..DerivationContext::default() };
        let overrides = ModelOverrides::new().with_context(context);
        let err = select_builtin("hybrid_mamba_8b", &overrides).unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedFeatureForFamily { ref feature, .. } if feature == "lora_finetune"));
        assert!(select_builtin("7b", &overrides).is_ok());
    }

    #[test]
    fn test_explicit_value_beats_derived_default() {
        let spec = select_builtin("hybrid_mamba_test", &ModelOverrides::new()).unwrap();
        assert_eq!(spec.setting("lowercase_loss_reweighting"), Some(&ConfigValue::Float(0.1)));

        let overrides = ModelOverrides::new()
            .with("lowercase_loss_reweighting", 0.25)
            .with("to_upper", "weighted")
            .with("distribute_saved_activations", false);
        let spec = select_builtin("hybrid_mamba_test", &overrides).unwrap();
        assert_eq!(spec.setting("lowercase_loss_reweighting"), Some(&ConfigValue::Float(0.25)));
        assert_eq!(spec.setting("to_upper"), Some(&ConfigValue::from("weighted")));
        assert_eq!(spec.setting("distribute_saved_activations"), Some(&ConfigValue::Bool(false)));
    }

    #[test]
    fn test_sequence_parallel_drives_activation_distribution() {
        let overrides = ModelOverrides::new().with("sequence_parallel", true);
        let spec = select_builtin("1b", &overrides).unwrap();
        assert_eq!(spec.setting("distribute_saved_activations"), Some(&ConfigValue::Bool(false)));
    }

    #[test]
    fn test_activation_checkpointing_modes() {
        let disabled = DerivationContext {
            activation_checkpointing: ActivationCheckpointing::Disabled,
            ..DerivationContext::default()
        };
        let spec = select_builtin("7b", &ModelOverrides::new().with_context(disabled)).unwrap();
        assert_eq!(spec.setting("recompute_granularity"), Some(&ConfigValue::Null));
        assert_eq!(spec.setting("recompute_num_layers"), Some(&ConfigValue::Null));

        let selective = DerivationContext {
            activation_checkpointing: ActivationCheckpointing::Selective,
            ..DerivationContext::default()
        };
        let spec = select_builtin("7b", &ModelOverrides::new().with_context(selective)).unwrap();
        assert_eq!(spec.setting("recompute_granularity"), Some(&ConfigValue::from("selective")));
        assert_eq!(spec.setting("recompute_method"), Some(&ConfigValue::Null));
    }

    #[test]
    fn test_pattern_must_match_layer_count() {
        let overrides = ModelOverrides::new().with("num_layers", 8_u32);
        let err = select_builtin("7b", &overrides).unwrap_err();
        assert!(matches!(err, PlanError::InvalidOverrideValue { ref key, .. } if key == "hybrid_override_pattern"));

        let overrides = ModelOverrides::new()
            .with("num_layers", 8_u32)
            .with("hybrid_override_pattern", "SDH*SDH*")
            .with("recompute_num_layers", 2_u32);
        let spec = select_builtin("7b", &overrides).unwrap();
        assert_eq!(spec.num_layers(), 8);
    }

    #[test]
    fn test_pattern_symbols_are_family_specific() {
        let overrides = ModelOverrides::new().with("hybrid_override_pattern", "M-M*");
        assert!(select_builtin("test", &overrides).is_err());
        assert!(select_builtin("hybrid_mamba_test", &overrides).is_ok());
    }

    #[test]
    fn test_override_values_are_type_checked() {
        let overrides = ModelOverrides::new().with("hidden_dropout", 1.5);
        let err = select_builtin("7b", &overrides).unwrap_err();
        assert_eq!(err.kind(), "InvalidOverrideValue");

        let overrides = ModelOverrides::new().with("recompute_method", "sometimes");
        assert!(select_builtin("7b", &overrides).is_err());
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(ConfigValue::parse_literal("None"), ConfigValue::Null);
        assert_eq!(ConfigValue::parse_literal("True"), ConfigValue::Bool(true));
        assert_eq!(ConfigValue::parse_literal("12"), ConfigValue::Int(12));
        assert_eq!(ConfigValue::parse_literal("0.5"), ConfigValue::Float(0.5));
        assert_eq!(ConfigValue::parse_literal("'full'"), ConfigValue::from("full"));
        assert_eq!(ConfigValue::parse_literal("inf"), ConfigValue::from("inf"));
    }
}
