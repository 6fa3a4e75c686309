//! Configuration version activation. A version must be activated before runs
//! against it are admitted: activation hooks act as a gate, and passing the
//! gate builds (or rebuilds) the version's environment.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tabula_model::{Annotation, ConfigManifest, ConfigVersionId};
use tracing::info;

use crate::error::Result;
use crate::hooks::{HookRegistry, StageSnapshot};
use crate::provision::EnvironmentProvisioner;

/// An activated configuration version and everything runs against it need.
pub struct ActivationRecord {
    pub manifest: ConfigManifest,
    pub registry: Arc<HookRegistry>,
    /// Annotations produced by the activation hooks themselves.
    pub annotations: Vec<Annotation>,
    pub activated_at: DateTime<Utc>,
}

impl fmt::Debug for ActivationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationRecord")
            .field("config_version", &self.manifest.config_version)
            .field("annotations", &self.annotations.len())
            .field("activated_at", &self.activated_at)
            .finish()
    }
}

pub struct Activator {
    provisioner: Arc<EnvironmentProvisioner>,
    active: DashMap<ConfigVersionId, Arc<ActivationRecord>>,
}

impl fmt::Debug for Activator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activator")
            .field("active_versions", &self.active.len())
            .finish()
    }
}

impl Activator {
    pub fn new(provisioner: Arc<EnvironmentProvisioner>) -> Self {
        Self {
            provisioner,
            active: DashMap::new(),
        }
    }

    /// Activate a configuration version.
    ///
    /// The activation hooks run first and gate everything: when any of them
    /// fails, the version is left untouched and no environment build is
    /// started. Re-activating a version retries a previously failed build.
    pub async fn activate(
        &self,
        manifest: ConfigManifest,
        registry: HookRegistry,
    ) -> Result<Arc<ActivationRecord>> {
        let config_version = manifest.config_version;
        let snapshot = StageSnapshot::activation(
            config_version,
            json!({
                "network_opt_in": manifest.network_opt_in,
                "requirements": manifest
                    .dependency_spec
                    .as_ref()
                    .map(|spec| spec.requirements.len())
                    .unwrap_or(0),
            }),
        );
        let annotations = registry.run_activation(&snapshot)?;

        if let Some(spec) = &manifest.dependency_spec {
            self.provisioner.rebuild(config_version, spec).await?;
        }

        let record = Arc::new(ActivationRecord {
            manifest,
            registry: Arc::new(registry),
            annotations,
            activated_at: Utc::now(),
        });
        self.active.insert(config_version, Arc::clone(&record));
        info!(
            target: "engine::activation",
            config_version = %config_version,
            "configuration version activated"
        );
        Ok(record)
    }

    pub fn is_active(&self, config_version: ConfigVersionId) -> bool {
        self.active.contains_key(&config_version)
    }

    pub fn record(&self, config_version: ConfigVersionId) -> Option<Arc<ActivationRecord>> {
        self.active.get(&config_version).map(|r| Arc::clone(&r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::hooks::{HookOutcome, HookRecord};
    use crate::provision::{BuildStatus, PackageInstaller};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tabula_model::{DependencySpec, HookStage, InstalledPackage};

    struct RecordingInstaller {
        installs: AtomicUsize,
    }

    #[async_trait]
    impl PackageInstaller for RecordingInstaller {
        async fn install(
            &self,
            _config_version: ConfigVersionId,
            spec: &DependencySpec,
            _network: &crate::netpolicy::GuardedConnector,
        ) -> Result<Vec<InstalledPackage>> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(spec
                .requirements
                .iter()
                .map(|req| InstalledPackage::new(req.name.clone(), "1.0.0"))
                .collect())
        }
    }

    fn activator() -> (Activator, Arc<RecordingInstaller>) {
        let installer = Arc::new(RecordingInstaller {
            installs: AtomicUsize::new(0),
        });
        let provisioner = Arc::new(EnvironmentProvisioner::new(installer.clone()));
        (Activator::new(provisioner), installer)
    }

    #[tokio::test]
    async fn activation_builds_the_environment() {
        let (activator, installer) = activator();
        let manifest = ConfigManifest::new(ConfigVersionId::new())
            .with_dependencies(DependencySpec::from_requirements("pdf-tools==1.4.2"));
        let config_version = manifest.config_version;

        let record = activator
            .activate(manifest, HookRegistry::new())
            .await
            .unwrap();
        assert!(activator.is_active(config_version));
        assert_eq!(installer.installs.load(Ordering::SeqCst), 1);
        assert_eq!(
            activator
                .provisioner
                .build_record(config_version)
                .unwrap()
                .status,
            BuildStatus::Ready
        );
        assert!(record.annotations.is_empty());
    }

    #[tokio::test]
    async fn failing_activation_hook_leaves_version_inactive_and_skips_the_build() {
        let (activator, installer) = activator();
        let manifest = ConfigManifest::new(ConfigVersionId::new())
            .with_dependencies(DependencySpec::from_requirements("pdf-tools==1.4.2"));
        let config_version = manifest.config_version;
        let registry = HookRegistry::new().register(HookRecord::new(
            "compat-check",
            HookStage::Activation,
            Arc::new(|_| HookOutcome::Fatal("unsupported schema".into())),
        ));

        let err = activator.activate(manifest, registry).await.unwrap_err();
        assert!(matches!(err, EngineError::ActivationFailed { .. }));
        assert!(!activator.is_active(config_version));
        assert_eq!(installer.installs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn activation_hook_annotations_are_retained_on_the_record() {
        let (activator, _) = activator();
        let manifest = ConfigManifest::new(ConfigVersionId::new());
        let registry = HookRegistry::new().register(HookRecord::new(
            "fingerprint",
            HookStage::Activation,
            Arc::new(|_| HookOutcome::Ok(Some(json!({ "fingerprint": "abc" })))),
        ));

        let record = activator.activate(manifest, registry).await.unwrap();
        assert_eq!(record.annotations.len(), 1);
        assert_eq!(record.annotations[0].hook_name, "fingerprint");
    }
}
