use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::ConfigVersionId;

/// Per-configuration-version facts the engine consumes from configuration
/// storage: what to install into the execution environment and whether the
/// version opted in to runtime network access.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigManifest {
    pub config_version: ConfigVersionId,
    #[serde(default)]
    pub dependency_spec: Option<DependencySpec>,
    /// Runtime egress is denied unless this is set for the version.
    #[serde(default)]
    pub network_opt_in: bool,
}

impl ConfigManifest {
    pub fn new(config_version: ConfigVersionId) -> Self {
        Self {
            config_version,
            dependency_spec: None,
            network_opt_in: false,
        }
    }

    pub fn with_dependencies(mut self, spec: DependencySpec) -> Self {
        self.dependency_spec = Some(spec);
        self
    }

    pub fn with_network_opt_in(mut self) -> Self {
        self.network_opt_in = true;
        self
    }
}

/// One requested package, optionally pinned.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PackageRequirement {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl fmt::Display for PackageRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}=={}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Declared dependency set for a configuration version.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub requirements: Vec<PackageRequirement>,
}

impl DependencySpec {
    /// Parse a requirements manifest: one requirement per line, `#` comments
    /// and blank lines skipped, `name==version` pins honored.
    pub fn from_requirements(text: &str) -> Self {
        let requirements = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| match line.split_once("==") {
                Some((name, version)) => PackageRequirement {
                    name: name.trim().to_string(),
                    version: Some(version.trim().to_string()),
                },
                None => PackageRequirement {
                    name: line.to_string(),
                    version: None,
                },
            })
            .collect();
        Self { requirements }
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }
}

/// A package materialized into an execution environment during a build.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

impl InstalledPackage {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_parser_skips_comments_and_blanks() {
        let spec = DependencySpec::from_requirements(
            "# table extraction deps\n\npdf-tools==1.4.2\n  column-detect \n",
        );
        assert_eq!(
            spec.requirements,
            vec![
                PackageRequirement {
                    name: "pdf-tools".into(),
                    version: Some("1.4.2".into()),
                },
                PackageRequirement {
                    name: "column-detect".into(),
                    version: None,
                },
            ]
        );
    }

    #[test]
    fn empty_manifest_is_empty() {
        assert!(DependencySpec::from_requirements("\n# nothing\n").is_empty());
    }
}
