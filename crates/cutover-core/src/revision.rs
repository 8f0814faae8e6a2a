//! Revisions — immutable, content-addressed deployable units.
//!
//! A [`RevisionSpec`] is what an operator asks to deploy. Registering it
//! with a cluster backend yields a [`Revision`], whose [`RevisionId`] is
//! derived from the spec content alone. Registering the same spec twice
//! therefore produces the same id, which makes registration safe to retry.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::image::ImageRef;

/// Content-derived identifier of a revision (`rev-<16 hex>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

impl RevisionId {
    /// Wrap an existing identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A container port exposed by the revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

impl PortMapping {
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
            protocol: default_protocol(),
        }
    }
}

/// Where the revision's container logs are shipped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogTarget {
    /// Log driver, e.g. `awslogs`.
    pub driver: String,
    /// Log group (or equivalent sink name).
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_prefix: Option<String>,
}

/// Everything needed to run one version of the application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevisionSpec {
    /// Container name inside the task.
    pub name: String,
    /// Image reference, e.g. `registry/app:v2` or `app@sha256:...`.
    pub image: String,
    /// CPU units (1024 = one vCPU).
    pub cpu: u32,
    pub memory_mib: u32,
    pub ports: Vec<PortMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<LogTarget>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RevisionError {
    #[error("invalid image: {0}")]
    Image(#[from] crate::image::ImageError),
    #[error("container name must not be empty")]
    EmptyName,
    #[error("cpu must be greater than zero")]
    ZeroCpu,
    #[error("memory must be greater than zero")]
    ZeroMemory,
    #[error("at least one port mapping is required")]
    NoPorts,
    #[error("duplicate container port {0}")]
    DuplicatePort(u16),
}

impl RevisionSpec {
    /// Check the spec is something a backend could run.
    pub fn validate(&self) -> Result<(), RevisionError> {
        if self.name.trim().is_empty() {
            return Err(RevisionError::EmptyName);
        }
        ImageRef::parse(&self.image)?;
        if self.cpu == 0 {
            return Err(RevisionError::ZeroCpu);
        }
        if self.memory_mib == 0 {
            return Err(RevisionError::ZeroMemory);
        }
        if self.ports.is_empty() {
            return Err(RevisionError::NoPorts);
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port.container_port) {
                return Err(RevisionError::DuplicatePort(port.container_port));
            }
        }
        Ok(())
    }

    /// Content-addressed id: SHA-256 over the canonical JSON of the spec.
    pub fn revision_id(&self) -> RevisionId {
        // Struct field order is fixed, so serde_json output is canonical.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(&canonical));
        RevisionId(format!("rev-{}", &digest[..16]))
    }
}

/// A registered revision. Never mutated after registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Revision {
    pub id: RevisionId,
    pub spec: RevisionSpec,
    /// The backend's own name for it (task definition ARN, etc.).
    pub backend_ref: String,
    /// Unix timestamp (seconds) of registration.
    pub registered_at: u64,
}
