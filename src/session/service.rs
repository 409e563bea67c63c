//! Public session API, the event loop and the periodic sweeps.

use super::record::{Disposition, InputRejected, RecordParts, SessionRecord};
use super::registry::SessionRegistry;
use super::signal::{self, SessionSignal, SignalObserver, SignalReceiver, SignalSender};
use super::{SessionId, SessionSnapshot, SessionStatus, StartRequest};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ErrorCode, Result};
use crate::events::{EventErrorCode, EventSink, OutputEvent, StdioStream};
use crate::external::{
    CliAvailability, CliLocator, DirectoryValidator, FixedCliLocator, PathValidation,
    PathValidator,
};
use crate::resources::{ResourceSample, ResourceSampler};
use crate::subprocess::{
    chat_args, ExitFuture, InputPipe, OutputPipe, ProcessIo, ProcessLauncher, ProcessSupervisor,
    TokioProcessLauncher,
};
use crate::termination::{MonitorTimeouts, ProcessTerminationMonitor};
use humantime_serde::re::humantime;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const READ_BUFFER_SIZE: usize = 8 * 1024;

struct ServiceInner {
    config: BridgeConfig,
    registry: SessionRegistry,
    supervisor: ProcessSupervisor,
    validator: Arc<dyn PathValidator>,
    locator: Arc<dyn CliLocator>,
    sink: Arc<dyn EventSink>,
    tx: SignalSender,
}

/// Starts, feeds, aborts and tracks chat sessions.
///
/// Must be created inside a tokio runtime: construction spawns the event loop
/// and the sweeps. Dropping the service stops them; live children are only
/// killed by [`SessionService::shutdown`].
pub struct SessionService {
    inner: Arc<ServiceInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionService {
    pub fn new(
        config: BridgeConfig,
        launcher: Arc<dyn ProcessLauncher>,
        validator: Arc<dyn PathValidator>,
        locator: Arc<dyn CliLocator>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(
            launcher,
            config.start_timeout,
            config.env_overrides.clone(),
        );
        let inner = Arc::new(ServiceInner {
            config,
            registry: SessionRegistry::new(),
            supervisor,
            validator,
            locator,
            sink,
            tx,
        });

        let mut tasks = vec![
            tokio::spawn(run_event_loop(Arc::clone(&inner), rx)),
            tokio::spawn(run_idle_sweep(Arc::clone(&inner))),
        ];
        if inner.config.resource_sample_interval.is_zero() {
            tracing::debug!("Resource sampling disabled");
        } else {
            tasks.push(tokio::spawn(run_resource_sweep(
                Arc::clone(&inner),
                ResourceSampler::new(),
            )));
        }

        Self {
            inner,
            tasks: Mutex::new(tasks),
        }
    }

    /// Service backed by real processes, absolute-directory validation and a
    /// fixed CLI path.
    pub fn production(
        config: BridgeConfig,
        cli_path: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::new(
            config,
            Arc::new(TokioProcessLauncher),
            Arc::new(DirectoryValidator),
            Arc::new(FixedCliLocator::new(cli_path)),
            sink,
        )
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Validate, spawn and register a new session.
    ///
    /// Failures are returned here and the session is never registered.
    pub async fn start(&self, request: StartRequest) -> Result<SessionId> {
        let inner = &self.inner;

        let working_dir = match inner.validator.validate(&request.working_dir).await {
            PathValidation::Valid { normalized } => normalized,
            PathValidation::Invalid { error } => {
                tracing::warn!(
                    "Rejected working directory {}: {}",
                    request.working_dir.display(),
                    error
                );
                return Err(BridgeError::session_with_code(
                    ErrorCode::SESSION_INVALID_PATH,
                    error,
                    None,
                ));
            }
        };

        let program = match inner.locator.locate().await {
            CliAvailability::Available { path } => path,
            CliAvailability::Unavailable { error } => {
                tracing::warn!("Chat CLI unavailable: {}", error);
                return Err(BridgeError::session_with_code(
                    ErrorCode::SESSION_CLI_UNAVAILABLE,
                    error,
                    None,
                ));
            }
        };

        let args = chat_args(&request.command, request.resume);
        let supervisor = match request.timeout {
            Some(timeout) => inner.supervisor.clone().with_start_timeout(timeout),
            None => inner.supervisor.clone(),
        };
        let (process, io) = supervisor
            .spawn(&program, &args, &working_dir)
            .await
            .map_err(|e| BridgeError::from(e).with_context("chat session not started"))?;

        let id = loop {
            let candidate = SessionId::generate();
            if !inner.registry.contains(&candidate) {
                break candidate;
            }
        };

        let monitor = ProcessTerminationMonitor::new(MonitorTimeouts {
            stdio_timeout: inner.config.stdio_timeout,
            process_exit_timeout: inner.config.process_exit_timeout,
        });
        monitor.add_observer(Arc::new(SignalObserver::new(id.clone(), inner.tx.clone())));

        let pid = process.pid();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let record = SessionRecord::new(
            RecordParts {
                id: id.clone(),
                command: request.command.clone(),
                working_dir: working_dir.clone(),
                model: request.model.clone(),
                process,
                input: input_tx,
                monitor,
                tx: inner.tx.clone(),
            },
            &inner.config,
        );
        if !inner.registry.insert(record) {
            return Err(BridgeError::session_with_code(
                ErrorCode::SESSION_INVALID_STATE,
                format!("Session id collision: {id}"),
                Some(id.to_string()),
            ));
        }

        let ProcessIo {
            stdin,
            stdout,
            stderr,
            exit,
        } = io;
        let tx = &inner.tx;
        tokio::spawn(read_output(id.clone(), StdioStream::Stdout, stdout, tx.clone()));
        tokio::spawn(read_output(id.clone(), StdioStream::Stderr, stderr, tx.clone()));
        tokio::spawn(write_input(id.clone(), stdin, input_rx, tx.clone()));
        tokio::spawn(wait_for_exit(id.clone(), exit, tx.clone()));

        tracing::info!(
            session_id = %id,
            pid = ?pid,
            model = ?request.model,
            "Started session in {}",
            working_dir.display()
        );
        Ok(id)
    }

    /// Queue a line of input for the session's child.
    pub fn send_input(&self, id: &SessionId, text: &str) -> Result<()> {
        let result = match self.inner.registry.lock().get_mut(id) {
            None => Err(BridgeError::session_not_found(id)),
            Some(record) => record.send_input(text).map_err(|rejected| match rejected {
                InputRejected::Terminal(status) => BridgeError::session_with_code(
                    ErrorCode::SESSION_INVALID_STATE,
                    format!("Session {id} is {status}"),
                    Some(id.to_string()),
                ),
                InputRejected::Closed => BridgeError::session_with_code(
                    ErrorCode::SESSION_INPUT_CLOSED,
                    format!("Input to session {id} is closed"),
                    Some(id.to_string()),
                ),
            }),
        };

        match &result {
            Ok(()) => tracing::debug!(session_id = %id, bytes = text.len(), "Queued input"),
            Err(e) => tracing::debug!(session_id = %id, "Input rejected: {}", e),
        }
        result
    }

    /// Kill a live session and drop it from the registry.
    ///
    /// Returns false for unknown ids and sessions already in a terminal state,
    /// so repeated aborts are harmless.
    pub fn abort(&self, id: &SessionId, reason: &str) -> bool {
        self.inner.abort(id, reason)
    }

    pub fn status(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.inner.registry.snapshot(id)
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        self.inner.registry.snapshots()
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Abort every session, stop the loop and the sweeps, empty the registry.
    pub fn shutdown(&self) {
        let ids = self.inner.registry.ids();
        let aborted = ids
            .iter()
            .filter(|id| self.inner.abort(id, "shutdown"))
            .count();

        for record in self.inner.registry.drain() {
            if !record.process.has_exited() {
                record.process.kill(self.inner.config.kill_grace);
            }
        }

        self.stop_tasks();
        tracing::info!(aborted, "Session service shut down");
    }

    fn stop_tasks(&self) {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for SessionService {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

impl ServiceInner {
    fn emit_all(&self, events: Vec<OutputEvent>) {
        for event in events {
            self.sink.emit(event);
        }
    }

    fn dispatch(&self, id: &SessionId, signal: SessionSignal) {
        let mut out = Vec::new();
        {
            let mut sessions = self.registry.lock();
            let Some(record) = sessions.get_mut(id) else {
                tracing::trace!(session_id = %id, "Dropping {} for unknown session", signal.name());
                return;
            };
            if record.handle(signal, &self.config, &mut out) == Disposition::Remove {
                if let Some(mut record) = sessions.remove(id) {
                    record.teardown();
                }
                tracing::info!(session_id = %id, "Session removed");
            }
        }
        self.emit_all(out);
    }

    fn abort(&self, id: &SessionId, reason: &str) -> bool {
        let event = {
            let mut sessions = self.registry.lock();
            let Some(record) = sessions.get(id) else {
                tracing::debug!(session_id = %id, "Abort ignored: unknown session");
                return false;
            };
            if record.status.is_terminal() {
                tracing::debug!(session_id = %id, "Abort ignored: session is {}", record.status);
                return false;
            }
            let Some(mut record) = sessions.remove(id) else {
                return false;
            };
            record.status = SessionStatus::Aborted;
            record.teardown();
            record.process.kill(self.config.kill_grace);
            tracing::info!(session_id = %id, pid = ?record.process.pid(), reason, "Session aborted");

            OutputEvent::SessionAborted {
                session_id: id.clone(),
                reason: reason.to_string(),
                exit_code: record.exit.and_then(|e| e.code()),
            }
        };
        self.sink.emit(event);
        true
    }

    /// Terminate sessions idle for longer than the inactivity timeout.
    fn sweep_idle(&self) {
        let timeout = self.config.inactivity_timeout;
        if timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut out = Vec::new();
        {
            let mut sessions = self.registry.lock();
            let idle: Vec<SessionId> = sessions
                .values()
                .filter(|record| record.idle_for(now) >= timeout)
                .map(|record| record.id.clone())
                .collect();

            for id in idle {
                let Some(mut record) = sessions.remove(&id) else {
                    continue;
                };
                record.teardown();
                if record.status.is_terminal() {
                    tracing::debug!(session_id = %id, "Removing idle {} session", record.status);
                    continue;
                }
                tracing::warn!(session_id = %id, "Session idle for {:?}; terminating", timeout);
                record.process.kill(self.config.kill_grace);
                out.push(OutputEvent::error(
                    &id,
                    format!(
                        "Session timed out after {} of inactivity",
                        humantime::format_duration(timeout)
                    ),
                    EventErrorCode::SessionTimeout,
                ));
            }
        }
        self.emit_all(out);
    }

    fn store_samples(&self, live: &[(SessionId, u32)], samples: Vec<ResourceSample>) {
        let mut sessions = self.registry.lock();
        for sample in samples {
            let Some((id, _)) = live.iter().find(|(_, pid)| *pid == sample.pid) else {
                continue;
            };
            if let Some(record) = sessions.get_mut(id) {
                tracing::debug!(
                    session_id = %id,
                    pid = sample.pid,
                    memory_bytes = sample.memory_bytes,
                    cpu_percent = sample.cpu_percent,
                    "Resource sample"
                );
                record.resources = Some(sample);
            }
        }
    }
}

async fn run_event_loop(inner: Arc<ServiceInner>, mut rx: SignalReceiver) {
    while let Some((id, signal)) = rx.recv().await {
        inner.dispatch(&id, signal);
    }
}

fn ticker(period: std::time::Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_idle_sweep(inner: Arc<ServiceInner>) {
    let mut ticker = ticker(inner.config.sweep_interval);
    loop {
        ticker.tick().await;
        inner.sweep_idle();
    }
}

async fn run_resource_sweep(inner: Arc<ServiceInner>, sampler: ResourceSampler) {
    let mut ticker = ticker(inner.config.resource_sample_interval);
    loop {
        ticker.tick().await;
        let live = inner.registry.live_pids();
        if live.is_empty() {
            continue;
        }
        let pids: Vec<u32> = live.iter().map(|(_, pid)| *pid).collect();
        let samples = sampler.sample(&pids).await;
        inner.store_samples(&live, samples);
    }
}

async fn read_output(
    id: SessionId,
    stream: StdioStream,
    pipe: Option<OutputPipe>,
    tx: SignalSender,
) {
    if let Some(mut pipe) = pipe {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = SessionSignal::Output(stream, buf[..n].to_vec());
                    if !signal::send(&tx, &id, chunk) {
                        return;
                    }
                }
                Err(e) => {
                    signal::send(&tx, &id, SessionSignal::StreamError(stream, e.to_string()));
                    break;
                }
            }
        }
    }
    signal::send(&tx, &id, SessionSignal::StreamEnded(stream));
}

async fn write_input(
    id: SessionId,
    pipe: Option<InputPipe>,
    mut input: mpsc::UnboundedReceiver<String>,
    tx: SignalSender,
) {
    if let Some(mut pipe) = pipe {
        while let Some(text) = input.recv().await {
            if let Err(e) = write_line(&mut pipe, &text).await {
                signal::send(
                    &tx,
                    &id,
                    SessionSignal::StreamError(StdioStream::Stdin, e.to_string()),
                );
                break;
            }
        }
        if let Err(e) = pipe.shutdown().await {
            tracing::trace!(session_id = %id, "stdin shutdown: {}", e);
        }
    }
    signal::send(&tx, &id, SessionSignal::StreamEnded(StdioStream::Stdin));
}

async fn write_line(pipe: &mut InputPipe, text: &str) -> std::io::Result<()> {
    let line = format!("{text}\n");
    pipe.write_all(line.as_bytes()).await?;
    pipe.flush().await
}

async fn wait_for_exit(id: SessionId, exit: ExitFuture, tx: SignalSender) {
    let signal = match exit.await {
        Ok(outcome) => SessionSignal::ProcessExited(outcome),
        Err(e) => SessionSignal::ProcessError(e.to_string()),
    };
    signal::send(&tx, &id, signal);
}
