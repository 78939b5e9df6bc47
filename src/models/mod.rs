pub mod download;
pub mod hub;
pub mod manager;
pub mod metadata;
pub mod snapshot;

pub use download::{ensure_artifact, ArtifactReport, ArtifactStatus, ExtractAction};
pub use hub::{hub_registry, ArtifactSource, HubClient, ModelRegistry, RegistryFactory, SnapshotSource};
pub use manager::{
    core_artifacts, ensure_core_models, plan, ArchiveFormat, ArtifactDescriptor, BootstrapPlan,
    BootstrapReport,
};
pub use metadata::compute_sha256;
pub use snapshot::{ensure_qwen, plan_qwen, SnapshotPlan, SnapshotReport};
