//! Evoplan Core
//!
//! Resolves training options into a single, internally consistent run plan:
//! - Validating and normalizing the flat option mapping (`RunOptions`)
//! - Deriving the global batch size from the parallel topology
//! - Selecting and parameterizing an architecture family from the catalog
//! - Generating the deterministic run identity
//! - Assembling checkpoint/resume, diagnostics and overlap policies

pub mod architecture;
pub mod batch;
pub mod catalog;
pub mod config;
pub mod error;
pub mod execution;
pub mod identity;
pub mod layout;
pub mod options;
pub mod plan;
pub mod policy;
pub mod tracking;

pub use architecture::{select, ArchitectureSpec, ConfigValue, FamilyBuilder, ModelOverrides};
pub use batch::{resolve_global_batch_size, BatchTopology};
pub use catalog::{ArchitectureFamily, BaseHyperparameters, Catalog, CatalogEntry};
pub use config::{load_options_file, ConfigError, ConfigResult, EvoplanConfig};
pub use error::{PlanError, PlanResult};
pub use execution::ExecutionSettings;
pub use identity::{RunIdentity, IDENTITY_FORMAT_VERSION};
pub use layout::{CheckpointProbe, FsCheckpointProbe, RunLayout};
pub use options::{OptionValue, RawOptions, RunOptions};
pub use plan::{PlanResolver, RunPlan};
pub use policy::{Policy, PolicySet, PolicyStage, ResumeState};
pub use tracking::TrackingSettings;
