//! Collaborators the session service consumes but does not implement.
//!
//! The service trusts only what these return: a normalized, security-checked
//! working directory and the CLI path, which is used verbatim.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Outcome of validating a requested working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathValidation {
    Valid { normalized: PathBuf },
    Invalid { error: String },
}

/// Outcome of locating the chat CLI executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliAvailability {
    Available { path: String },
    Unavailable { error: String },
}

#[async_trait]
pub trait PathValidator: Send + Sync {
    async fn validate(&self, path: &Path) -> PathValidation;
}

#[async_trait]
pub trait CliLocator: Send + Sync {
    async fn locate(&self) -> CliAvailability;
}

/// Accepts absolute paths to existing directories, canonicalized.
pub struct DirectoryValidator;

#[async_trait]
impl PathValidator for DirectoryValidator {
    async fn validate(&self, path: &Path) -> PathValidation {
        if !path.is_absolute() {
            return PathValidation::Invalid {
                error: format!("Working directory must be absolute: {}", path.display()),
            };
        }
        match tokio::fs::canonicalize(path).await {
            Ok(normalized) if normalized.is_dir() => PathValidation::Valid { normalized },
            Ok(normalized) => PathValidation::Invalid {
                error: format!("Not a directory: {}", normalized.display()),
            },
            Err(e) => PathValidation::Invalid {
                error: format!("Cannot access {}: {}", path.display(), e),
            },
        }
    }
}

/// Always reports the same executable path.
pub struct FixedCliLocator {
    path: String,
}

impl FixedCliLocator {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CliLocator for FixedCliLocator {
    async fn locate(&self) -> CliAvailability {
        CliAvailability::Available {
            path: self.path.clone(),
        }
    }
}
