use std::path::PathBuf;
use thiserror::Error;

pub type PlanResult<T> = std::result::Result<T, PlanError>;

/// Every way run-plan resolution can fail.
///
/// All variants are raised before any execution resource exists; none of them
/// is ever downgraded to a default.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("invalid option combination ({}): {reason}", options.join(", "))]
    InvalidOptionCombination { options: Vec<String>, reason: String },

    #[error("invalid value for option `{option}`: {reason}")]
    InvalidOptionValue { option: String, reason: String },

    #[error("unknown option `{option}`")]
    UnknownOption { option: String },

    #[error("unknown size identifier `{identifier}`")]
    UnknownSizeIdentifier { identifier: String },

    #[error("size identifier `{identifier}` is claimed by several families: {}", families.join(", "))]
    AmbiguousSizeIdentifier { identifier: String, families: Vec<String> },

    #[error(
        "{world_size} devices cannot be split into model-parallel groups of {model_parallel_size}"
    )]
    NonIntegerParallelismDecomposition { world_size: u64, model_parallel_size: u64 },

    #[error("override `{key}` is not valid for the {family} family")]
    InvalidOverrideForFamily { family: String, key: String },

    #[error("override `{key}` for the {family} family: {reason}")]
    InvalidOverrideValue { family: String, key: String, reason: String },

    #[error("feature `{feature}` is not supported by the {family} family")]
    UnsupportedFeatureForFamily { family: String, feature: String },

    #[error(
        "restore path {} lies inside the auto-resume directory {}",
        restore_path.display(),
        checkpoint_dir.display()
    )]
    ConflictingResumeSources { restore_path: PathBuf, checkpoint_dir: PathBuf },

    #[error("communication-overlap preset `{preset}` does not support this precision setup: {reason}")]
    UnsupportedPrecisionCombination { preset: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PlanError {
    pub(crate) fn combination(options: &[&str], reason: impl Into<String>) -> Self {
        Self::InvalidOptionCombination {
            options: options.iter().map(|o| (*o).to_string()).collect(),
            reason: reason.into(),
        }
    }

    pub(crate) fn value(option: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOptionValue { option: option.to_string(), reason: reason.into() }
    }

    /// Stable name of the error kind, printed by front ends.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidOptionCombination { .. } => "InvalidOptionCombination",
            Self::InvalidOptionValue { .. } => "InvalidOptionValue",
            Self::UnknownOption { .. } => "UnknownOption",
            Self::UnknownSizeIdentifier { .. } => "UnknownSizeIdentifier",
            Self::AmbiguousSizeIdentifier { .. } => "AmbiguousSizeIdentifier",
            Self::NonIntegerParallelismDecomposition { .. } => "NonIntegerParallelismDecomposition",
            Self::InvalidOverrideForFamily { .. } => "InvalidOverrideForFamily",
            Self::InvalidOverrideValue { .. } => "InvalidOverrideValue",
            Self::UnsupportedFeatureForFamily { .. } => "UnsupportedFeatureForFamily",
            Self::ConflictingResumeSources { .. } => "ConflictingResumeSources",
            Self::UnsupportedPrecisionCombination { .. } => "UnsupportedPrecisionCombination",
            Self::Io(_) => "Io",
        }
    }

    /// Names of the options responsible for the failure, when known.
    pub fn options(&self) -> Vec<String> {
        match self {
            Self::InvalidOptionCombination { options, .. } => options.clone(),
            Self::InvalidOptionValue { option, .. } | Self::UnknownOption { option } => {
                vec![option.clone()]
            }
            Self::UnknownSizeIdentifier { .. } | Self::AmbiguousSizeIdentifier { .. } => {
                vec!["model_size".to_string()]
            }
            Self::NonIntegerParallelismDecomposition { .. } => vec![
                "num_nodes".to_string(),
                "devices".to_string(),
                "tensor_parallel_size".to_string(),
                "pipeline_model_parallel_size".to_string(),
                "context_parallel_size".to_string(),
            ],
            Self::InvalidOverrideForFamily { key, .. } | Self::InvalidOverrideValue { key, .. } => {
                vec![key.clone()]
            }
            Self::UnsupportedFeatureForFamily { feature, .. } => vec![feature.clone()],
            Self::ConflictingResumeSources { .. } => vec!["ckpt_dir".to_string()],
            Self::UnsupportedPrecisionCombination { .. } => vec![
                "use_megatron_comm_overlap_llama3_8k".to_string(),
                "bf16_main_grads".to_string(),
            ],
            Self::Io(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combination_lists_every_option() {
        let err = PlanError::combination(&["dataset_config", "mock_data"], "exactly one is required");
        assert_eq!(err.kind(), "InvalidOptionCombination");
        assert_eq!(err.options(), vec!["dataset_config", "mock_data"]);
        assert!(err.to_string().contains("dataset_config, mock_data"));
    }
}
