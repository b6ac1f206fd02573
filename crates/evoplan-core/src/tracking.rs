use crate::identity::RunIdentity;
use crate::options::RunOptions;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WandbSettings {
    pub project: String,
    /// `wandb_run_name` when given, otherwise the run identity.
    pub name: String,
    pub entity: Option<String>,
    pub tags: Vec<String>,
    pub group: Option<String>,
    pub job_type: Option<String>,
    pub id: Option<String>,
    pub anonymous: bool,
    pub log_model: bool,
    pub offline: bool,
}

/// Identity metadata attached to every tracked run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingMetadata {
    pub run_identity: String,
    pub identity_digest: String,
    pub identity_format_version: u32,
}

/// Experiment-tracking configuration. The human-readable run name may be
/// replaced by the user; the checkpoint location never follows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingSettings {
    pub result_dir: PathBuf,
    pub experiment_name: String,
    pub tensorboard: bool,
    pub wandb: Option<WandbSettings>,
    pub metadata: TrackingMetadata,
}

impl TrackingSettings {
    #[must_use]
    pub fn derive(options: &RunOptions, identity: &RunIdentity) -> Self {
        let tracking = &options.tracking;
        let wandb = tracking.wandb_project.as_ref().map(|project| WandbSettings {
            project: project.clone(),
            name: tracking
                .wandb_run_name
                .clone()
                .unwrap_or_else(|| identity.as_str().to_string()),
            entity: tracking.wandb_entity.clone(),
            tags: tracking.wandb_tags.clone(),
            group: tracking.wandb_group.clone(),
            job_type: tracking.wandb_job_type.clone(),
            id: tracking.wandb_id.clone(),
            anonymous: tracking.wandb_anonymous,
            log_model: tracking.wandb_log_model,
            offline: tracking.wandb_offline,
        });

        Self {
            result_dir: options.checkpoint.result_dir.clone(),
            experiment_name: options.checkpoint.experiment_name.clone(),
            tensorboard: tracking.tensorboard,
            wandb,
            metadata: TrackingMetadata {
                run_identity: identity.as_str().to_string(),
                identity_digest: identity.digest().to_string(),
                identity_format_version: identity.version(),
            },
        }
    }
}
