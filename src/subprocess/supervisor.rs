//! Spawning with start confirmation and SIGTERM to SIGKILL escalation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::builder::LaunchSpecBuilder;
use super::error::ProcessError;
use super::launcher::{
    ExitFuture, InputPipe, KillSignal, LaunchSpec, OutputPipe, ProcessControl, ProcessLauncher,
    SpawnedProcess, TokioProcessLauncher,
};

/// Shared handle used to stop a supervised child.
///
/// Cloning is cheap; every clone refers to the same kill state, so `kill` is
/// idempotent across all of them.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    control: Arc<dyn ProcessControl>,
    kill_requested: Arc<AtomicBool>,
    escalation: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("kill_requested", &self.is_kill_requested())
            .finish()
    }
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, control: Arc<dyn ProcessControl>) -> Self {
        Self {
            pid,
            control,
            kill_requested: Arc::new(AtomicBool::new(false)),
            escalation: Arc::new(Mutex::new(None)),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.control.has_exited()
    }

    pub fn is_kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    /// Send SIGTERM and schedule SIGKILL after `grace` unless the child exits
    /// first. Returns false if a kill was already requested.
    pub fn kill(&self, grace: Duration) -> bool {
        if self.kill_requested.swap(true, Ordering::SeqCst) {
            tracing::debug!(pid = ?self.pid, "Kill already requested; ignoring");
            return false;
        }

        if let Err(e) = self.control.signal(KillSignal::Terminate) {
            tracing::warn!(pid = ?self.pid, "Failed to send SIGTERM: {}", e);
        } else {
            tracing::debug!(pid = ?self.pid, "Sent SIGTERM");
        }

        let control = Arc::clone(&self.control);
        let pid = self.pid;
        let deadline = tokio::time::Instant::now() + grace;
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if control.has_exited() {
                return;
            }
            tracing::warn!(pid = ?pid, "Process still running after {:?}; sending SIGKILL", grace);
            if let Err(e) = control.signal(KillSignal::Kill) {
                tracing::warn!(pid = ?pid, "Failed to send SIGKILL: {}", e);
            }
        });

        *self
            .escalation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);
        true
    }

    /// Drop a pending SIGKILL, e.g. after the exit was observed.
    pub fn cancel_escalation(&self) {
        if let Some(task) = self
            .escalation
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Stdio pipes and exit future of a supervised child.
pub struct ProcessIo {
    pub stdin: Option<InputPipe>,
    pub stdout: Option<OutputPipe>,
    pub stderr: Option<OutputPipe>,
    pub exit: ExitFuture,
}

impl std::fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Starts chat CLI processes with the fixed environment and a start deadline.
#[derive(Clone)]
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    start_timeout: Duration,
    env_overrides: BTreeMap<String, String>,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        start_timeout: Duration,
        env_overrides: BTreeMap<String, String>,
    ) -> Self {
        Self {
            launcher,
            start_timeout,
            env_overrides,
        }
    }

    pub fn production(start_timeout: Duration, env_overrides: BTreeMap<String, String>) -> Self {
        Self::new(Arc::new(TokioProcessLauncher), start_timeout, env_overrides)
    }

    /// Override the start deadline, e.g. for a single request.
    pub fn with_start_timeout(mut self, start_timeout: Duration) -> Self {
        self.start_timeout = start_timeout;
        self
    }

    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    pub fn launch_spec(&self, program: &str, args: &[String], cwd: &Path) -> LaunchSpec {
        LaunchSpecBuilder::new(program)
            .args(args)
            .envs(&self.env_overrides)
            .current_dir(cwd)
            .build()
    }

    /// Spawn with piped stdio and wait for the start confirmation.
    pub async fn spawn(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
    ) -> Result<(ProcessHandle, ProcessIo), ProcessError> {
        let spec = self.launch_spec(program, args, cwd);
        let process = wait_for_start(self.launcher.launch(&spec), self.start_timeout).await?;
        tracing::info!(pid = ?process.pid, "Started {}", spec.display());

        let SpawnedProcess {
            pid,
            stdin,
            stdout,
            stderr,
            exit,
            control,
        } = process;

        Ok((
            ProcessHandle::new(pid, control),
            ProcessIo {
                stdin,
                stdout,
                stderr,
                exit,
            },
        ))
    }
}

/// Resolve with the first spawn confirmation, or fail after `timeout`.
pub async fn wait_for_start<F>(launch: F, timeout: Duration) -> Result<SpawnedProcess, ProcessError>
where
    F: std::future::Future<Output = Result<SpawnedProcess, ProcessError>>,
{
    match tokio::time::timeout(timeout, launch).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Process did not start within {:?}", timeout);
            Err(ProcessError::StartTimeout(timeout))
        }
    }
}
