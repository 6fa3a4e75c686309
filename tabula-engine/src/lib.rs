//! # Tabula Engine
//!
//! Run-processing engine for the Tabula document-processing platform: the
//! queued-run lifecycle from admission through execution to terminal state.
//!
//! ## Overview
//!
//! - **Admission**: submission against activated configuration versions,
//!   with queue-depth backpressure and manual operator retries
//! - **Leasing**: exclusive time-bounded ownership of runs, renewed while a
//!   worker holds them and reclaimed when a worker dies silently
//! - **Worker pool**: bounded concurrent execution slots driving runs
//!   through provisioning, hooks, and the transformation itself
//! - **Provisioning**: one environment per configuration version, built at
//!   most once in-process from the version's dependency spec
//! - **Network policy**: build-time egress always on, runtime egress only
//!   with the version's explicit opt-in
//! - **Hooks**: user callbacks at activation, pre-execution, and
//!   post-execution stages, observing read-only snapshots
//! - **Retries**: failed attempts are superseded by new linked rows with
//!   exponential backoff, never mutated in place
//!
//! ## Feature Flags
//!
//! - `postgres` (default): the SQLx-backed [`store::PostgresRunStore`]
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tabula_engine::{
//!     admission::SubmitRequest,
//!     config::EngineConfig,
//!     engine::Engine,
//!     hooks::HookRegistry,
//!     store::InMemoryRunStore,
//! };
//! use tabula_model::ConfigManifest;
//!
//! # async fn demo(
//! #     installer: Arc<dyn tabula_engine::provision::PackageInstaller>,
//! #     executor: Arc<dyn tabula_engine::worker::RunExecutor>,
//! #     config_source: Arc<dyn tabula_engine::worker::ConfigSource>,
//! # ) -> tabula_engine::error::Result<()> {
//! let store = Arc::new(InMemoryRunStore::new());
//! let mut engine = Engine::new(
//!     EngineConfig::default(),
//!     store,
//!     installer,
//!     executor,
//!     config_source,
//! );
//! engine.start();
//!
//! let manifest = ConfigManifest::new(Default::default());
//! let config_version = manifest.config_version;
//! engine.activator().activate(manifest, HookRegistry::new()).await?;
//! engine
//!     .admission()
//!     .submit(SubmitRequest::new(config_version, "docs/lease.pdf"))
//!     .await?;
//! # engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hooks;
pub mod lease;
pub mod netpolicy;
pub mod provision;
pub mod store;
pub mod worker;

pub use activation::{ActivationRecord, Activator};
pub use admission::{AdmissionOutcome, AdmissionQueue, RunStatusView, SubmitRequest};
pub use config::{AdmissionConfig, EngineConfig, LeaseConfig, PoolConfig, RetryConfig};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use events::EventSink;
pub use hooks::{HookOutcome, HookRecord, HookRegistry, StageSnapshot};
pub use lease::{ClaimedRun, Lease, LeaseManager};
pub use netpolicy::{ExecutionPhase, GuardedConnector, NetworkCapability};
pub use provision::{
    BuildStatus, EnvironmentBuild, EnvironmentHandle, EnvironmentProvisioner, PackageInstaller,
};
pub use store::{InMemoryRunStore, RunStore, TerminalOutcome};
pub use worker::{
    ConfigSource, ExecutionContext, ExecutionStatus, RunExecutor, WorkerContext, WorkerPool,
};
