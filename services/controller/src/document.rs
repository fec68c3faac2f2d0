//! Declarative input documents.
//!
//! The user-facing shape of a spec:
//!
//! ```yaml
//! name: mpi
//! replicaCount: 4
//! containerImage: mpi-tf-worker:latest
//! resourceLimits:
//!   deviceCount: 1
//! volumeMounts:
//!   - hostPath: /srv/shared
//!     mountPath: /workdir
//! ```
//!
//! JSON, YAML and TOML are accepted; the format of a file follows its
//! extension.

use std::path::Path;

use rekon_id::ResourceName;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::model::{PodTemplate, ResourceLimits, ResourceSpec, VolumeMount};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
    Toml,
}

impl DocumentFormat {
    /// Format implied by a file extension. Unknown extensions read as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            Some("toml") => Self::Toml,
            _ => Self::Yaml,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentLimits {
    #[serde(default)]
    pub device_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host_path: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// A desired-state document as submitted by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DesiredDocument {
    pub name: String,
    pub replica_count: i64,
    pub container_image: String,
    #[serde(default)]
    pub resource_limits: DocumentLimits,
    #[serde(default)]
    pub volume_mounts: Vec<DocumentMount>,
}

impl DesiredDocument {
    pub fn parse(contents: &str, format: DocumentFormat) -> Result<Self, ValidationError> {
        let parsed = match format {
            DocumentFormat::Json => serde_json::from_str(contents).map_err(|e| e.to_string()),
            DocumentFormat::Yaml => serde_yaml::from_str(contents).map_err(|e| e.to_string()),
            DocumentFormat::Toml => toml::from_str(contents).map_err(|e| e.to_string()),
        };
        parsed.map_err(ValidationError::Document)
    }

    /// Read and parse a document file.
    pub fn from_path(path: &Path) -> Result<Self, ValidationError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ValidationError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&contents, DocumentFormat::from_path(path))
    }

    /// Convert into a validated [`ResourceSpec`].
    pub fn into_spec(self) -> Result<ResourceSpec, ValidationError> {
        let name = ResourceName::parse(&self.name)?;

        let volume_mounts = self
            .volume_mounts
            .into_iter()
            .enumerate()
            .map(|(i, mount)| VolumeMount {
                name: mount.name.unwrap_or_else(|| format!("vol-{i}")),
                host_path: mount.host_path.into(),
                mount_path: mount.mount_path.into(),
                read_only: mount.read_only,
            })
            .collect();

        let spec = ResourceSpec {
            name,
            replicas: self.replica_count,
            template: PodTemplate {
                image: self.container_image,
                resources: ResourceLimits {
                    device_count: self.resource_limits.device_count,
                },
                volume_mounts,
            },
        };
        spec.validate()?;
        Ok(spec)
    }
}

impl From<&ResourceSpec> for DesiredDocument {
    fn from(spec: &ResourceSpec) -> Self {
        Self {
            name: spec.name.to_string(),
            replica_count: spec.replicas,
            container_image: spec.template.image.clone(),
            resource_limits: DocumentLimits {
                device_count: spec.template.resources.device_count,
            },
            volume_mounts: spec
                .template
                .volume_mounts
                .iter()
                .map(|m| DocumentMount {
                    name: Some(m.name.clone()),
                    host_path: m.host_path.display().to_string(),
                    mount_path: m.mount_path.display().to_string(),
                    read_only: m.read_only,
                })
                .collect(),
        }
    }
}
