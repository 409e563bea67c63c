//! Per-session resource sampling of child processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::RwLock;

/// Latest resource usage of one child.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub pid: u32,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
    pub sampled_at: DateTime<Utc>,
}

/// Samples memory and CPU of specific processes.
#[derive(Clone)]
pub struct ResourceSampler {
    system: Arc<RwLock<System>>,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: Arc::new(RwLock::new(System::new())),
        }
    }

    /// Refresh and read the given processes. Processes that are gone are skipped.
    pub async fn sample(&self, pids: &[u32]) -> Vec<ResourceSample> {
        if pids.is_empty() {
            return Vec::new();
        }
        let targets: Vec<Pid> = pids.iter().copied().map(Pid::from_u32).collect();

        let mut system = self.system.write().await;
        system.refresh_processes(ProcessesToUpdate::Some(&targets), true);

        let now = Utc::now();
        targets
            .iter()
            .filter_map(|pid| {
                system.process(*pid).map(|process| ResourceSample {
                    pid: pid.as_u32(),
                    memory_bytes: process.memory(),
                    cpu_percent: process.cpu_usage(),
                    sampled_at: now,
                })
            })
            .collect()
    }
}
