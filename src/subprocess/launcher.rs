use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::ProcessError;

/// Everything needed to start one child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Applied on top of the inherited environment
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Program and arguments joined for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
}

impl ExitOutcome {
    /// Exit code, `None` when the process was terminated by a signal.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Code(code) => Some(*code),
            ExitOutcome::Signal(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signal(signal);
            }
        }
        ExitOutcome::Code(-1)
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exit code {code}"),
            ExitOutcome::Signal(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// Signals used to stop a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KillSignal {
    Terminate,
    Kill,
}

impl KillSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillSignal::Terminate => "SIGTERM",
            KillSignal::Kill => "SIGKILL",
        }
    }
}

impl std::fmt::Display for KillSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type OutputPipe = Pin<Box<dyn AsyncRead + Send>>;
pub type InputPipe = Pin<Box<dyn AsyncWrite + Send>>;
pub type ExitFuture = Pin<Box<dyn Future<Output = Result<ExitOutcome, ProcessError>> + Send>>;

/// Out-of-band control over a running child.
pub trait ProcessControl: Send + Sync {
    fn signal(&self, signal: KillSignal) -> Result<(), ProcessError>;
    fn has_exited(&self) -> bool;
}

/// A started child with its stdio pipes and exit future.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub stdin: Option<InputPipe>,
    pub stdout: Option<OutputPipe>,
    pub stderr: Option<OutputPipe>,
    pub exit: ExitFuture,
    pub control: Arc<dyn ProcessControl>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.pid)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Starts child processes. Resolves once the OS confirmed the spawn.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError>;
}

/// Launches real processes with piped stdio in their own process group.
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    fn configure_command(spec: &LaunchSpec) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&spec.program);

        // New process group so signals reach every descendant
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd
    }

    fn map_spawn_error(error: std::io::Error, spec: &LaunchSpec) -> ProcessError {
        if error.kind() == std::io::ErrorKind::NotFound {
            ProcessError::CommandNotFound(spec.program.clone())
        } else {
            ProcessError::SpawnFailed {
                command: spec.display(),
                source: error,
            }
        }
    }
}

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError> {
        tracing::debug!(
            "Spawning process: {} (working_dir: {:?})",
            spec.display(),
            spec.working_dir
        );
        tracing::trace!("Environment overrides: {:?}", spec.env);

        let mut child = Self::configure_command(spec).spawn().map_err(|e| {
            tracing::error!("Failed to spawn '{}': {:?} (kind: {:?})", spec.program, e, e.kind());
            Self::map_spawn_error(e, spec)
        })?;

        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let control = Arc::new(UnixProcessControl {
            pid,
            exited: Arc::clone(&exited),
        });

        let stdin = child.stdin.take().map(|s| Box::pin(s) as InputPipe);
        let stdout = child.stdout.take().map(|s| Box::pin(s) as OutputPipe);
        let stderr = child.stderr.take().map(|s| Box::pin(s) as OutputPipe);

        let exit: ExitFuture = Box::pin(async move {
            let result = child.wait().await;
            exited.store(true, Ordering::SeqCst);
            match result {
                Ok(status) => Ok(ExitOutcome::from_status(status)),
                Err(e) => Err(ProcessError::Wait(e.to_string())),
            }
        });

        Ok(SpawnedProcess {
            pid,
            stdin,
            stdout,
            stderr,
            exit,
            control,
        })
    }
}

struct UnixProcessControl {
    pid: Option<u32>,
    exited: Arc<AtomicBool>,
}

impl ProcessControl for UnixProcessControl {
    #[cfg(unix)]
    fn signal(&self, signal: KillSignal) -> Result<(), ProcessError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.has_exited() {
            return Ok(());
        }

        let nix_signal = match signal {
            KillSignal::Terminate => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        };
        // Negative pid addresses the whole process group
        let pgid = Pid::from_raw(-(pid as i32));
        match kill(pgid, nix_signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ProcessError::Signal {
                pid: pid as i32,
                signal: signal.as_str(),
                message: errno.desc().to_string(),
            }),
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: KillSignal) -> Result<(), ProcessError> {
        Ok(())
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}
