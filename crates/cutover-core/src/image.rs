//! Container image reference parsing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A parsed container image reference:
/// `[registry/]repository[:tag][@digest]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host, e.g. `123456789012.dkr.ecr.eu-west-1.amazonaws.com`.
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest, e.g. `sha256:9f86d0...`.
    pub digest: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("image reference is empty")]
    Empty,
    #[error("invalid image reference: {0}")]
    Invalid(String),
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, ImageError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageError::Empty);
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(ImageError::Invalid(reference.to_string()));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(ImageError::Invalid(reference.to_string()));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (registry, path) = match name.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (Some(first.to_string()), rest),
            _ => (None, name),
        };

        // A tag separator only counts inside the last path component.
        let last_slash = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match path[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (&path[..split], Some(path[split + 1..].to_string()))
            }
            None => (path, None),
        };

        if repository.is_empty()
            || repository.starts_with('/')
            || repository.ends_with('/')
            || tag.as_deref() == Some("")
        {
            return Err(ImageError::Invalid(reference.to_string()));
        }

        Ok(ImageRef {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Whether the reference pins content (carries a digest).
    pub fn is_pinned(&self) -> bool {
        self.digest.is_some()
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn is_registry_host(segment: &str) -> bool {
    segment == "localhost" || segment.contains('.') || segment.contains(':')
}
