//! Testing utilities and fixtures
//!
//! A [`TestHarness`] wires a [`SessionService`] to an in-memory
//! [`MockLauncher`], a permissive path validator and a [`CollectingSink`], so
//! tests can drive a session by writing to the mock child's pipes and then
//! inspect the emitted events.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::{CollectingSink, OutputEvent};
use crate::external::{CliAvailability, CliLocator, PathValidation, PathValidator};
use crate::session::{SessionId, SessionService, StartRequest};
use crate::subprocess::{MockLauncher, MockProcess};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Accepts every path as given.
pub struct AcceptingValidator;

#[async_trait]
impl PathValidator for AcceptingValidator {
    async fn validate(&self, path: &Path) -> PathValidation {
        PathValidation::Valid {
            normalized: path.to_path_buf(),
        }
    }
}

/// Rejects every path with a fixed message.
pub struct RejectingValidator(pub String);

#[async_trait]
impl PathValidator for RejectingValidator {
    async fn validate(&self, _path: &Path) -> PathValidation {
        PathValidation::Invalid {
            error: self.0.clone(),
        }
    }
}

/// Always answers with the same availability.
pub struct StaticLocator(pub CliAvailability);

impl StaticLocator {
    pub fn available(path: &str) -> Self {
        Self(CliAvailability::Available {
            path: path.to_string(),
        })
    }

    pub fn unavailable(error: &str) -> Self {
        Self(CliAvailability::Unavailable {
            error: error.to_string(),
        })
    }
}

#[async_trait]
impl CliLocator for StaticLocator {
    async fn locate(&self) -> CliAvailability {
        self.0.clone()
    }
}

/// Defaults with resource sampling off, so sweeps never touch real pids.
pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        resource_sample_interval: Duration::ZERO,
        ..BridgeConfig::default()
    }
}

/// Session service backed by mock processes.
pub struct TestHarness {
    pub service: SessionService,
    pub launcher: MockLauncher,
    pub sink: CollectingSink,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: BridgeConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(AcceptingValidator),
            Arc::new(StaticLocator::available("/usr/local/bin/q")),
        )
    }

    pub fn with_collaborators(
        config: BridgeConfig,
        validator: Arc<dyn PathValidator>,
        locator: Arc<dyn CliLocator>,
    ) -> Self {
        let launcher = MockLauncher::new();
        let sink = CollectingSink::new();
        let service = SessionService::new(
            config,
            Arc::new(launcher.clone()),
            validator,
            locator,
            Arc::new(sink.clone()),
        );
        Self {
            service,
            launcher,
            sink,
        }
    }

    /// Start a `chat` session and take control of its mock child.
    pub async fn start_chat(&self, working_dir: &str) -> Result<(SessionId, MockProcess)> {
        let id = self
            .service
            .start(StartRequest::new("chat", working_dir))
            .await?;
        let process = self
            .launcher
            .take_process()
            .ok_or_else(|| BridgeError::other("mock launcher produced no process"))?;
        Ok((id, process))
    }

    /// Let reader tasks, the event loop and due timers run.
    pub async fn settle(&self) {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.sink.events()
    }

    pub fn events_named(&self, name: &str) -> Vec<OutputEvent> {
        self.sink
            .events()
            .into_iter()
            .filter(|event| event.name() == name)
            .collect()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
