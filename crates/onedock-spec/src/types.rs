//! Caller-supplied service specification

use crate::error::SpecError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Pattern a service name must match to be safely embeddable in a container
/// name. Hyphens are allowed inside the name; the container-name grammar
/// stays unambiguous because decoding anchors on the `-p<n>-c<n>-<n>` tail.
static SERVICE_NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid pattern"));

/// A single volume mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path or named volume
    pub source: String,
    /// Mount point inside the container
    pub destination: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

/// Declarative description of a service, supplied per deploy/update call
///
/// The spec is transient: it is never persisted, and only the fields encoded
/// into the container name and labels survive a daemon restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// DNS-safe service name, unique on the host
    pub name: String,
    /// Image name without tag (e.g. `nginx`)
    pub image: String,
    /// Image tag (e.g. `alpine`)
    pub tag: String,
    /// Port the application listens on inside the container
    pub internal_port: u16,
    /// Stable host port external callers reach the service on
    pub public_port: u16,
    /// Desired replica count; 0 is treated as 1 at deploy time
    #[serde(default)]
    pub replicas: u32,
    /// Inline environment variables; win over `env_file` on key conflict
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Optional KEY=VALUE file read at container-create time
    #[serde(default)]
    pub env_file: Option<String>,
    /// Volume mounts, in declaration order
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Entrypoint override
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Command override
    #[serde(default)]
    pub command: Vec<String>,
    /// Working directory override
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ServiceSpec {
    /// Full image reference, `image:tag`
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Validate the fields a deploy depends on
    ///
    /// # Errors
    ///
    /// Returns a [`SpecError`] for an empty or non-DNS-safe name, an empty
    /// image or tag, a port outside `1..=65535`, or a volume mount missing a
    /// source or destination.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(SpecError::InvalidName {
                name: self.name.clone(),
                reason: "name is empty".to_string(),
            });
        }
        if !SERVICE_NAME_RE.is_match(&self.name) {
            return Err(SpecError::InvalidName {
                name: self.name.clone(),
                reason: "must start alphanumeric and contain only [A-Za-z0-9._-]".to_string(),
            });
        }
        if self.image.is_empty() {
            return Err(SpecError::InvalidImage("image is empty".to_string()));
        }
        if self.tag.is_empty() {
            return Err(SpecError::InvalidImage("tag is empty".to_string()));
        }
        if self.public_port == 0 {
            return Err(SpecError::InvalidPort {
                field: "public",
                value: 0,
            });
        }
        if self.internal_port == 0 {
            return Err(SpecError::InvalidPort {
                field: "internal",
                value: 0,
            });
        }
        for volume in &self.volumes {
            if volume.source.is_empty() || volume.destination.is_empty() {
                return Err(SpecError::InvalidVolume(
                    "source and destination must be non-empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Whether an update from `self` to `other` changes anything a container
    /// is built from. Used to log no-op rolling updates; the update itself
    /// always rebuilds replicas.
    pub fn differs_from(&self, other: &ServiceSpec) -> bool {
        self.image != other.image
            || self.tag != other.tag
            || self.internal_port != other.internal_port
            || self.environment != other.environment
            || self.env_file != other.env_file
            || self.volumes != other.volumes
            || self.entrypoint != other.entrypoint
            || self.command != other.command
            || self.working_dir != other.working_dir
    }
}
