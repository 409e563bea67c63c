use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;

use super::error::ProcessError;
use super::launcher::{
    ExitFuture, ExitOutcome, InputPipe, KillSignal, LaunchSpec, OutputPipe, ProcessControl,
    ProcessLauncher, SpawnedProcess,
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the next launch should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    NotFound,
    SpawnError,
    /// Never confirm the start
    Hang,
}

#[derive(Default)]
struct MockState {
    launches: Vec<LaunchSpec>,
    processes: VecDeque<MockProcess>,
    failures: VecDeque<MockFailure>,
    exit_on_signal: bool,
    next_pid: u32,
}

/// In-memory launcher backed by duplex pipes.
///
/// Each launch queues a [`MockProcess`] controller that tests take with
/// [`MockLauncher::take_process`] to write output, read input and exit.
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fail the next launch in the given way.
    pub fn fail_next(&self, failure: MockFailure) {
        self.state().failures.push_back(failure);
    }

    /// Make children exit as soon as they receive any signal.
    pub fn exit_on_signal(&self, enabled: bool) {
        self.state().exit_on_signal = enabled;
    }

    /// Controller of the oldest launched process not yet taken.
    pub fn take_process(&self) -> Option<MockProcess> {
        self.state().processes.pop_front()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state().launches.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.state().launches.len()
    }
}

#[async_trait]
impl ProcessLauncher for MockLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError> {
        let failure = {
            let mut state = self.state();
            state.launches.push(spec.clone());
            state.failures.pop_front()
        };

        match failure {
            Some(MockFailure::NotFound) => {
                return Err(ProcessError::CommandNotFound(spec.program.clone()))
            }
            Some(MockFailure::SpawnError) => {
                return Err(ProcessError::SpawnFailed {
                    command: spec.display(),
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                })
            }
            Some(MockFailure::Hang) => return futures::future::pending().await,
            None => {}
        }

        let (child_stdin, test_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (child_stdout, test_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (child_stderr, test_stderr) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let mut state = self.state();
        state.next_pid += 1;
        let pid = 10_000 + state.next_pid;

        let shared = Arc::new(MockShared {
            signals: Mutex::new(Vec::new()),
            exited: AtomicBool::new(false),
            exit_tx: Mutex::new(Some(exit_tx)),
            exit_on_signal: state.exit_on_signal,
        });

        state.processes.push_back(MockProcess {
            pid,
            stdin: Some(test_stdin),
            stdout: Some(test_stdout),
            stderr: Some(test_stderr),
            shared: Arc::clone(&shared),
        });

        let exit: ExitFuture = Box::pin(async move {
            match exit_rx.await {
                Ok(result) => result,
                // Controller dropped without exiting: the child just keeps running
                Err(_) => futures::future::pending().await,
            }
        });

        Ok(SpawnedProcess {
            pid: Some(pid),
            stdin: Some(Box::pin(child_stdin) as InputPipe),
            stdout: Some(Box::pin(child_stdout) as OutputPipe),
            stderr: Some(Box::pin(child_stderr) as OutputPipe),
            exit,
            control: shared,
        })
    }
}

struct MockShared {
    signals: Mutex<Vec<KillSignal>>,
    exited: AtomicBool,
    exit_tx: Mutex<Option<oneshot::Sender<Result<ExitOutcome, ProcessError>>>>,
    exit_on_signal: bool,
}

impl MockShared {
    fn finish(&self, result: Result<ExitOutcome, ProcessError>) -> bool {
        let sender = self
            .exit_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                self.exited.store(true, Ordering::SeqCst);
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

impl ProcessControl for MockShared {
    fn signal(&self, signal: KillSignal) -> Result<(), ProcessError> {
        self.signals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(signal);
        if self.exit_on_signal {
            let number = match signal {
                KillSignal::Terminate => 15,
                KillSignal::Kill => 9,
            };
            self.finish(Ok(ExitOutcome::Signal(number)));
        }
        Ok(())
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Test-side controller of one mock child.
pub struct MockProcess {
    pid: u32,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    shared: Arc<MockShared>,
}

impl std::fmt::Debug for MockProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProcess")
            .field("pid", &self.pid)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

impl MockProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn write_stdout(&mut self, data: impl AsRef<[u8]>) {
        if let Some(pipe) = self.stdout.as_mut() {
            let _ = pipe.write_all(data.as_ref()).await;
        }
    }

    pub async fn write_stderr(&mut self, data: impl AsRef<[u8]>) {
        if let Some(pipe) = self.stderr.as_mut() {
            let _ = pipe.write_all(data.as_ref()).await;
        }
    }

    pub fn close_stdout(&mut self) {
        self.stdout = None;
    }

    pub fn close_stderr(&mut self) {
        self.stderr = None;
    }

    /// Close stdout and stderr, as a child does when it exits.
    pub fn close_output(&mut self) {
        self.close_stdout();
        self.close_stderr();
    }

    /// Read whatever input has been written so far, up to the pipe capacity.
    pub async fn read_stdin(&mut self) -> String {
        let Some(pipe) = self.stdin.as_mut() else {
            return String::new();
        };
        let mut buf = vec![0u8; PIPE_CAPACITY];
        match pipe.read(&mut buf).await {
            Ok(n) => String::from_utf8_lossy(&buf[..n]).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// Read stdin until the bridge closes it.
    pub async fn read_stdin_to_end(&mut self) -> String {
        let Some(mut pipe) = self.stdin.take() else {
            return String::new();
        };
        let mut text = String::new();
        let _ = pipe.read_to_string(&mut text).await;
        text
    }

    /// Report process exit. Returns false if the process already exited.
    pub fn exit(&mut self, outcome: ExitOutcome) -> bool {
        self.shared.finish(Ok(outcome))
    }

    /// Report a failure from the OS while waiting on the child.
    pub fn fail(&mut self, message: &str) -> bool {
        self.shared.finish(Err(ProcessError::Wait(message.to_string())))
    }

    pub fn has_exited(&self) -> bool {
        self.shared.has_exited()
    }

    pub fn signals(&self) -> Vec<KillSignal> {
        self.shared
            .signals
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
