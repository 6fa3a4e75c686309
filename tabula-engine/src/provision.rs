//! Execution environment provisioning. Each configuration version gets one
//! environment built from its dependency spec; the build runs at most once
//! per version in-process, serialized by a per-version mutex.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tabula_model::{ConfigVersionId, DependencySpec, InstalledPackage};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::netpolicy::{ExecutionPhase, GuardedConnector, NetworkCapability};

/// Lifecycle of one environment build.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BuildStatus {
    Building,
    Ready,
    Failed,
}

/// Durable-in-process record of one build attempt for a configuration version.
#[derive(Clone, Debug)]
pub struct EnvironmentBuild {
    pub config_version: ConfigVersionId,
    pub status: BuildStatus,
    pub installed: Vec<InstalledPackage>,
    pub diagnostic: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Ready-to-use environment for one run. Carries the network capability its
/// code executes under; `with_network` rescopes it for the Runtime phase.
#[derive(Clone, Debug)]
pub struct EnvironmentHandle {
    pub config_version: ConfigVersionId,
    pub installed_packages: Arc<Vec<InstalledPackage>>,
    network: NetworkCapability,
}

impl EnvironmentHandle {
    fn new(config_version: ConfigVersionId, installed: Vec<InstalledPackage>) -> Self {
        Self {
            config_version,
            installed_packages: Arc::new(installed),
            network: NetworkCapability::scope(ExecutionPhase::Runtime, false),
        }
    }

    pub fn with_network(mut self, network: NetworkCapability) -> Self {
        self.network = network;
        self
    }

    pub fn network(&self) -> NetworkCapability {
        self.network
    }

    pub fn connector(&self) -> GuardedConnector {
        GuardedConnector::new(self.network)
    }
}

/// Materializes a dependency spec into an environment. Implementations talk
/// to the package index through the connector they are given, which is always
/// scoped to the Build phase.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(
        &self,
        config_version: ConfigVersionId,
        spec: &DependencySpec,
        network: &GuardedConnector,
    ) -> Result<Vec<InstalledPackage>>;
}

pub struct EnvironmentProvisioner {
    installer: Arc<dyn PackageInstaller>,
    builds: DashMap<ConfigVersionId, Arc<Mutex<Option<EnvironmentBuild>>>>,
}

impl fmt::Debug for EnvironmentProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentProvisioner")
            .field("tracked_versions", &self.builds.len())
            .finish()
    }
}

impl EnvironmentProvisioner {
    pub fn new(installer: Arc<dyn PackageInstaller>) -> Self {
        Self {
            installer,
            builds: DashMap::new(),
        }
    }

    fn slot(&self, config_version: ConfigVersionId) -> Arc<Mutex<Option<EnvironmentBuild>>> {
        self.builds
            .entry(config_version)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Environment for `config_version`, building it on first use.
    ///
    /// A version without dependencies is trivially ready. A prior failed
    /// build is a hard stop: the version stays unusable until it is rebuilt
    /// through re-activation, so runs against it fail fast instead of
    /// retrying a build that is known broken.
    pub async fn ensure_ready(
        &self,
        config_version: ConfigVersionId,
        spec: Option<&DependencySpec>,
    ) -> Result<EnvironmentHandle> {
        let spec = match spec {
            Some(spec) if !spec.is_empty() => spec,
            _ => return Ok(EnvironmentHandle::new(config_version, Vec::new())),
        };

        let slot = self.slot(config_version);
        let mut guard = slot.lock().await;
        match guard.as_ref() {
            Some(build) if build.status == BuildStatus::Ready => {
                return Ok(EnvironmentHandle::new(config_version, build.installed.clone()));
            }
            Some(build) if build.status == BuildStatus::Failed => {
                return Err(EngineError::BuildFailed {
                    config_version,
                    diagnostic: build
                        .diagnostic
                        .clone()
                        .unwrap_or_else(|| "environment build previously failed".into()),
                });
            }
            _ => {}
        }
        self.build_locked(config_version, spec, &mut guard).await
    }

    /// Build (or rebuild) the environment during activation. Unlike
    /// `ensure_ready`, a previously failed build is cleared and retried.
    pub async fn rebuild(
        &self,
        config_version: ConfigVersionId,
        spec: &DependencySpec,
    ) -> Result<EnvironmentHandle> {
        if spec.is_empty() {
            return Ok(EnvironmentHandle::new(config_version, Vec::new()));
        }
        let slot = self.slot(config_version);
        let mut guard = slot.lock().await;
        if let Some(build) = guard.as_ref()
            && build.status == BuildStatus::Ready
        {
            return Ok(EnvironmentHandle::new(config_version, build.installed.clone()));
        }
        self.build_locked(config_version, spec, &mut guard).await
    }

    /// Current build record for a version, if any build has been attempted.
    pub fn build_record(&self, config_version: ConfigVersionId) -> Option<EnvironmentBuild> {
        let slot = self.builds.get(&config_version)?;
        let guard = slot.try_lock().ok()?;
        guard.clone()
    }

    async fn build_locked(
        &self,
        config_version: ConfigVersionId,
        spec: &DependencySpec,
        guard: &mut Option<EnvironmentBuild>,
    ) -> Result<EnvironmentHandle> {
        let started_at = Utc::now();
        *guard = Some(EnvironmentBuild {
            config_version,
            status: BuildStatus::Building,
            installed: Vec::new(),
            diagnostic: None,
            started_at,
            finished_at: None,
        });

        let connector =
            GuardedConnector::new(NetworkCapability::scope(ExecutionPhase::Build, false));
        info!(
            target: "engine::provision",
            config_version = %config_version,
            requirements = spec.requirements.len(),
            "building environment"
        );

        match self.installer.install(config_version, spec, &connector).await {
            Ok(installed) => {
                *guard = Some(EnvironmentBuild {
                    config_version,
                    status: BuildStatus::Ready,
                    installed: installed.clone(),
                    diagnostic: None,
                    started_at,
                    finished_at: Some(Utc::now()),
                });
                info!(
                    target: "engine::provision",
                    config_version = %config_version,
                    packages = installed.len(),
                    "environment ready"
                );
                Ok(EnvironmentHandle::new(config_version, installed))
            }
            Err(err) => {
                let diagnostic = err.to_string();
                *guard = Some(EnvironmentBuild {
                    config_version,
                    status: BuildStatus::Failed,
                    installed: Vec::new(),
                    diagnostic: Some(diagnostic.clone()),
                    started_at,
                    finished_at: Some(Utc::now()),
                });
                warn!(
                    target: "engine::provision",
                    config_version = %config_version,
                    diagnostic,
                    "environment build failed"
                );
                Err(EngineError::BuildFailed {
                    config_version,
                    diagnostic,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingInstaller {
        installs: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl CountingInstaller {
        fn new() -> Self {
            Self {
                installs: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            }
        }

        fn failing_first(count: usize) -> Self {
            Self {
                installs: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(count),
            }
        }
    }

    #[async_trait]
    impl PackageInstaller for CountingInstaller {
        async fn install(
            &self,
            _config_version: ConfigVersionId,
            spec: &DependencySpec,
            network: &GuardedConnector,
        ) -> Result<Vec<InstalledPackage>> {
            assert!(network.capability().allows_egress());
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::Internal("index unreachable".into()));
            }
            Ok(spec
                .requirements
                .iter()
                .map(|req| {
                    InstalledPackage::new(
                        req.name.clone(),
                        req.version.clone().unwrap_or_else(|| "0.0.0".into()),
                    )
                })
                .collect())
        }
    }

    fn spec() -> DependencySpec {
        DependencySpec::from_requirements("pdf-tools==1.4.2\ncolumn-detect\n")
    }

    #[tokio::test]
    async fn concurrent_ensure_ready_builds_once() {
        let installer = Arc::new(CountingInstaller::new());
        let provisioner = Arc::new(EnvironmentProvisioner::new(installer.clone()));
        let config_version = ConfigVersionId::new();
        let spec = spec();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provisioner = Arc::clone(&provisioner);
            let spec = spec.clone();
            handles.push(tokio::spawn(async move {
                provisioner.ensure_ready(config_version, Some(&spec)).await
            }));
        }
        for handle in handles {
            let env = handle.await.unwrap().unwrap();
            assert_eq!(env.installed_packages.len(), 2);
        }
        assert_eq!(installer.installs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_dependencies_is_trivially_ready() {
        let provisioner = EnvironmentProvisioner::new(Arc::new(CountingInstaller::new()));
        let env = provisioner
            .ensure_ready(ConfigVersionId::new(), None)
            .await
            .unwrap();
        assert!(env.installed_packages.is_empty());
    }

    #[tokio::test]
    async fn failed_build_is_a_hard_stop_for_ensure_ready() {
        let installer = Arc::new(CountingInstaller::failing_first(1));
        let provisioner = EnvironmentProvisioner::new(installer.clone());
        let config_version = ConfigVersionId::new();
        let spec = spec();

        let err = provisioner
            .ensure_ready(config_version, Some(&spec))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BuildFailed { .. }));

        // Later runs fail fast without re-invoking the installer.
        let err = provisioner
            .ensure_ready(config_version, Some(&spec))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BuildFailed { .. }));
        assert_eq!(installer.installs.load(Ordering::SeqCst), 1);

        let record = provisioner.build_record(config_version).unwrap();
        assert_eq!(record.status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn rebuild_retries_a_failed_build() {
        let installer = Arc::new(CountingInstaller::failing_first(1));
        let provisioner = EnvironmentProvisioner::new(installer.clone());
        let config_version = ConfigVersionId::new();
        let spec = spec();

        assert!(provisioner.rebuild(config_version, &spec).await.is_err());
        let env = provisioner.rebuild(config_version, &spec).await.unwrap();
        assert_eq!(env.installed_packages.len(), 2);
        assert_eq!(installer.installs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rebuild_reuses_a_ready_environment() {
        let installer = Arc::new(CountingInstaller::new());
        let provisioner = EnvironmentProvisioner::new(installer.clone());
        let config_version = ConfigVersionId::new();
        let spec = spec();

        provisioner.rebuild(config_version, &spec).await.unwrap();
        provisioner.rebuild(config_version, &spec).await.unwrap();
        assert_eq!(installer.installs.load(Ordering::SeqCst), 1);
    }
}
