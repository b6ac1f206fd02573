use crate::error::PlanResult;
use crate::identity::RunIdentity;
use crate::options::{CheckpointLayout, CheckpointOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Filesystem layout for a run's outputs.
///
/// Default layout is `<result_dir>/<experiment_name>/checkpoints`; the
/// identity-scoped layout inserts the identity's short digest before
/// `checkpoints`.
#[derive(Debug, Clone)]
pub struct RunLayout {
    result_dir: PathBuf,
    experiment_name: String,
    layout: CheckpointLayout,
}

impl RunLayout {
    #[must_use]
    pub fn new(result_dir: PathBuf, experiment_name: impl Into<String>, layout: CheckpointLayout) -> Self {
        Self { result_dir, experiment_name: experiment_name.into(), layout }
    }

    #[must_use]
    pub fn from_options(options: &CheckpointOptions) -> Self {
        Self::new(options.result_dir.clone(), options.experiment_name.clone(), options.layout)
    }

    #[must_use]
    pub fn experiment_dir(&self) -> PathBuf {
        self.result_dir.join(&self.experiment_name)
    }

    /// Where checkpoints for `identity` are written and auto-resumed from.
    #[must_use]
    pub fn checkpoints_dir(&self, identity: &RunIdentity) -> PathBuf {
        match self.layout {
            CheckpointLayout::Experiment => self.experiment_dir().join("checkpoints"),
            CheckpointLayout::RunIdentity => {
                self.experiment_dir().join(identity.short_digest()).join("checkpoints")
            }
        }
    }
}

/// Answers whether a resumable checkpoint exists at a location.
pub trait CheckpointProbe {
    fn has_checkpoint(&self, dir: &Path) -> PlanResult<bool>;
}

/// Probe backed by the local filesystem. Read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsCheckpointProbe;

impl CheckpointProbe for FsCheckpointProbe {
    fn has_checkpoint(&self, dir: &Path) -> PlanResult<bool> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_name().to_string_lossy().starts_with('.') {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
