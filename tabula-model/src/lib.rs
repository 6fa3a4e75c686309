//! Core data model definitions shared across Tabula crates.

pub mod events;
pub mod ids;
pub mod manifest;
pub mod run;

pub use events::{RunEvent, RunEventKind};
pub use ids::{ConfigVersionId, LeaseId, RunId};
pub use manifest::{ConfigManifest, DependencySpec, InstalledPackage, PackageRequirement};
pub use run::{Annotation, ErrorCode, HookStage, RunPriority, RunRecord, RunStatus};
