//! Per-session state and the handlers that mutate it.
//!
//! Handlers run on the event loop with the registry locked. They never block,
//! never fail, and only collect events; the caller emits them after unlocking.

use super::signal::{self, SessionSignal, SignalSender, TimerKind};
use super::{SessionId, SessionSnapshot, SessionStatus};
use crate::config::BridgeConfig;
use crate::events::{EventErrorCode, InfoType, OutputEvent, StdioStream};
use crate::output::{
    classify_with_rule, is_prompt_ready, is_thinking_indicator, strip_ansi, FlushedParagraph,
    InitializationAggregator, LineAssembler, MessageClass, ParagraphAssembler, ThinkingDecision,
    ThinkingDeduplicator, THINKING_MESSAGE,
};
use crate::resources::ResourceSample;
use crate::subprocess::{ExitOutcome, ProcessHandle};
use crate::termination::{ProcessTerminationMonitor, TimeoutReason};
use crate::timer::TimerHandle;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Timers owned by one session.
///
/// Each arm gets a fresh generation; a fire whose generation is no longer
/// current was superseded and is ignored.
pub(crate) struct SessionTimers {
    id: SessionId,
    tx: SignalSender,
    generation: u64,
    armed: HashMap<TimerKind, (u64, TimerHandle)>,
}

impl SessionTimers {
    pub(crate) fn new(id: SessionId, tx: SignalSender) -> Self {
        Self {
            id,
            tx,
            generation: 0,
            armed: HashMap::new(),
        }
    }

    /// (Re)arm `kind`; a previously armed timer of the same kind is cancelled.
    pub(crate) fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.generation += 1;
        let generation = self.generation;
        let id = self.id.clone();
        let tx = self.tx.clone();
        let handle = TimerHandle::after(delay, async move {
            signal::send(&tx, &id, SessionSignal::Timer(kind, generation));
        });
        self.armed.insert(kind, (generation, handle));
    }

    pub(crate) fn cancel(&mut self, kind: TimerKind) {
        self.armed.remove(&kind);
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Consume a fire. False when the fire is stale.
    pub(crate) fn take_fired(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.armed.get(&kind) {
            Some((current, _)) if *current == generation => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.armed.clear();
    }
}

/// What the loop should do with the record after a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Keep,
    Remove,
}

/// Everything tracked for one live session.
pub(crate) struct SessionRecord {
    pub(crate) id: SessionId,
    pub(crate) status: SessionStatus,
    pub(crate) command: String,
    pub(crate) working_dir: PathBuf,
    pub(crate) model: Option<String>,
    pub(crate) process: ProcessHandle,
    input: Option<mpsc::UnboundedSender<String>>,
    monitor: ProcessTerminationMonitor,
    stdout: LineAssembler,
    stderr: LineAssembler,
    paragraphs: ParagraphAssembler,
    init: InitializationAggregator,
    thinking: ThinkingDeduplicator,
    last_info: Option<(String, Instant)>,
    pending_tools: Vec<String>,
    tools_used: Vec<String>,
    pub(crate) exit: Option<ExitOutcome>,
    pub(crate) resources: Option<ResourceSample>,
    timers: SessionTimers,
    tx: SignalSender,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_activity_at: Instant,
}

/// Launch details kept on the record.
pub(crate) struct RecordParts {
    pub(crate) id: SessionId,
    pub(crate) command: String,
    pub(crate) working_dir: PathBuf,
    pub(crate) model: Option<String>,
    pub(crate) process: ProcessHandle,
    pub(crate) input: mpsc::UnboundedSender<String>,
    pub(crate) monitor: ProcessTerminationMonitor,
    pub(crate) tx: SignalSender,
}

impl SessionRecord {
    pub(crate) fn new(parts: RecordParts, config: &BridgeConfig) -> Self {
        let now = Utc::now();
        Self {
            timers: SessionTimers::new(parts.id.clone(), parts.tx.clone()),
            tx: parts.tx,
            id: parts.id,
            status: SessionStatus::Running,
            command: parts.command,
            working_dir: parts.working_dir,
            model: parts.model,
            process: parts.process,
            input: Some(parts.input),
            monitor: parts.monitor,
            stdout: LineAssembler::new(),
            stderr: LineAssembler::new(),
            paragraphs: ParagraphAssembler::new(),
            init: InitializationAggregator::new(
                config.init_complete_delay,
                config.init_idle_delay,
            ),
            thinking: ThinkingDeduplicator::new(),
            last_info: None,
            pending_tools: Vec::new(),
            tools_used: Vec::new(),
            exit: None,
            resources: None,
            started_at: now,
            last_activity: now,
            last_activity_at: Instant::now(),
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            status: self.status,
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            model: self.model.clone(),
            pid: self.process.pid(),
            started_at: self.started_at,
            last_activity: self.last_activity,
            tools_used: self.tools_used.clone(),
            resources: self.resources,
            exit: self.exit,
        }
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.last_activity_at = Instant::now();
    }

    /// Queue a line for the child's stdin.
    ///
    /// The turn reset is queued on the event loop before the line reaches the
    /// writer, so it is ordered ahead of any output the line provokes.
    pub(crate) fn send_input(&mut self, text: &str) -> Result<(), InputRejected> {
        if self.status.is_terminal() {
            return Err(InputRejected::Terminal(self.status));
        }
        let Some(input) = self.input.as_ref().filter(|input| !input.is_closed()) else {
            return Err(InputRejected::Closed);
        };
        signal::send(&self.tx, &self.id, SessionSignal::InputQueued);
        input
            .send(text.to_string())
            .map_err(|_| InputRejected::Closed)?;
        self.touch();
        Ok(())
    }

    /// A new turn started: thinking may be shown again and the banner is over.
    fn on_input_queued(&mut self, out: &mut Vec<OutputEvent>) {
        self.thinking.reset();
        self.finish_init(out);
    }

    /// Stop input delivery; the writer closes stdin once drained.
    pub(crate) fn close_input(&mut self) {
        self.input.take();
    }

    /// Cancel every owned timer and release the termination monitor.
    pub(crate) fn teardown(&mut self) {
        self.close_input();
        self.timers.clear();
        self.monitor.destroy();
        self.stdout.clear();
        self.stderr.clear();
        self.paragraphs.clear();
    }

    pub(crate) fn handle(
        &mut self,
        signal: SessionSignal,
        config: &BridgeConfig,
        out: &mut Vec<OutputEvent>,
    ) -> Disposition {
        match signal {
            SessionSignal::Output(stream, chunk) => self.on_output(stream, &chunk, config, out),
            SessionSignal::StreamEnded(stream) => {
                tracing::debug!(session_id = %self.id, "{} ended", stream);
                self.monitor.stream_ended(stream);
            }
            SessionSignal::StreamError(stream, message) => {
                tracing::warn!(session_id = %self.id, "{} error: {}", stream, message);
                out.push(OutputEvent::stream_error(&self.id, stream, message.as_str()));
                self.monitor.stream_error(stream, &message);
            }
            SessionSignal::InputQueued => self.on_input_queued(out),
            SessionSignal::ProcessExited(outcome) => self.on_exit(outcome),
            SessionSignal::ProcessError(message) => self.on_process_error(&message, config, out),
            SessionSignal::FullyTerminated(exit) => self.on_terminated(exit, config, out),
            SessionSignal::TerminationTimeout(reason) => self.on_timeout(&reason, out),
            SessionSignal::Timer(kind, generation) => {
                if !self.timers.take_fired(kind, generation) {
                    tracing::trace!(session_id = %self.id, "Ignoring stale {:?} timer", kind);
                    return Disposition::Keep;
                }
                return self.on_timer(kind, config, out);
            }
        }
        Disposition::Keep
    }

    fn on_output(
        &mut self,
        stream: StdioStream,
        chunk: &[u8],
        config: &BridgeConfig,
        out: &mut Vec<OutputEvent>,
    ) {
        self.touch();
        let lines = match stream {
            StdioStream::Stdout => self.stdout.push(chunk),
            StdioStream::Stderr => self.stderr.push(chunk),
            StdioStream::Stdin => return,
        };
        for line in lines {
            self.route_line(stream, &line, config, out);
        }

        let (needs_flush, kind) = match stream {
            StdioStream::Stdout => (
                self.stdout.needs_flush_timer() || !self.paragraphs.is_empty(),
                TimerKind::StdoutFlush,
            ),
            _ => (self.stderr.needs_flush_timer(), TimerKind::StderrFlush),
        };
        if needs_flush {
            self.timers.arm(kind, config.line_flush_delay);
        } else {
            self.timers.cancel(kind);
        }
    }

    fn route_line(
        &mut self,
        stream: StdioStream,
        raw: &str,
        config: &BridgeConfig,
        out: &mut Vec<OutputEvent>,
    ) {
        let cleaned = strip_ansi(raw);
        for line in cleaned.split('\n') {
            tracing::trace!(session_id = %self.id, "{}: {}", stream, line);
            if self.init.accepts(line) {
                let delay = self.init.push(line);
                self.timers.arm(TimerKind::InitFlush, delay);
                continue;
            }
            if is_thinking_indicator(line) {
                self.finish_init(out);
                if self.thinking.observe() == ThinkingDecision::Emit {
                    out.push(OutputEvent::info(
                        &self.id,
                        THINKING_MESSAGE,
                        InfoType::Progress,
                    ));
                }
                continue;
            }
            if is_prompt_ready(line) {
                self.thinking.reset();
                continue;
            }
            match stream {
                StdioStream::Stdout => self.route_stdout(line, out),
                _ => self.route_stderr(line, config, out),
            }
        }
    }

    fn route_stdout(&mut self, line: &str, out: &mut Vec<OutputEvent>) {
        if !line.trim().is_empty() {
            // Regular answer text means the banner is over.
            self.finish_init(out);
            self.thinking.settle();
        }
        if let Some(paragraph) = self.paragraphs.push_line(line) {
            self.emit_paragraph(paragraph, out);
        }
    }

    fn route_stderr(&mut self, line: &str, config: &BridgeConfig, out: &mut Vec<OutputEvent>) {
        match classify_with_rule(line) {
            (MessageClass::Skip, rule) => {
                tracing::trace!(session_id = %self.id, rule, "Skipping stderr line");
            }
            (MessageClass::Info(kind), rule) => {
                tracing::trace!(session_id = %self.id, rule, "stderr info");
                self.emit_info(line.trim(), kind, config.info_dedup_window, out);
            }
            (MessageClass::Error, rule) => {
                tracing::debug!(session_id = %self.id, rule, "stderr error: {}", line);
                out.push(OutputEvent::error(
                    &self.id,
                    line.trim(),
                    EventErrorCode::StderrOutput,
                ));
            }
        }
    }

    fn emit_info(
        &mut self,
        message: &str,
        kind: InfoType,
        window: Duration,
        out: &mut Vec<OutputEvent>,
    ) {
        let now = Instant::now();
        if let Some((last, at)) = &self.last_info {
            if last == message && now.saturating_duration_since(*at) < window {
                tracing::trace!(session_id = %self.id, "Suppressing repeated info");
                return;
            }
        }
        self.last_info = Some((message.to_string(), now));
        out.push(OutputEvent::info(&self.id, message, kind));
    }

    fn emit_paragraph(&mut self, paragraph: FlushedParagraph, out: &mut Vec<OutputEvent>) {
        for tool in paragraph.tools {
            if !self.tools_used.contains(&tool) {
                self.tools_used.push(tool.clone());
            }
            if !self.pending_tools.contains(&tool) {
                self.pending_tools.push(tool);
            }
        }
        if let Some(data) = paragraph.data {
            let tools = std::mem::take(&mut self.pending_tools);
            out.push(OutputEvent::response(&self.id, data, tools));
        }
    }

    /// End the banner phase and emit the consolidated message, once.
    fn finish_init(&mut self, out: &mut Vec<OutputEvent>) {
        self.timers.cancel(TimerKind::InitFlush);
        if let Some(message) = self.init.finish() {
            tracing::debug!(session_id = %self.id, "Initialization complete");
            out.push(OutputEvent::info(&self.id, message, InfoType::Initialization));
        }
    }

    fn flush_fragments(&mut self, config: &BridgeConfig, out: &mut Vec<OutputEvent>) {
        if let Some(fragment) = self.stdout.flush() {
            self.route_line(StdioStream::Stdout, &fragment, config, out);
        }
        if let Some(fragment) = self.stderr.flush() {
            self.route_line(StdioStream::Stderr, &fragment, config, out);
        }
    }

    fn on_timer(
        &mut self,
        kind: TimerKind,
        config: &BridgeConfig,
        out: &mut Vec<OutputEvent>,
    ) -> Disposition {
        match kind {
            TimerKind::StdoutFlush => {
                if let Some(fragment) = self.stdout.flush() {
                    self.route_line(StdioStream::Stdout, &fragment, config, out);
                }
                if let Some(paragraph) = self.paragraphs.flush_stale() {
                    self.emit_paragraph(paragraph, out);
                }
            }
            TimerKind::StderrFlush => {
                if let Some(fragment) = self.stderr.flush() {
                    self.route_line(StdioStream::Stderr, &fragment, config, out);
                }
            }
            TimerKind::InitFlush => self.finish_init(out),
            TimerKind::Removal => {
                tracing::debug!(session_id = %self.id, "Removal grace elapsed");
                return Disposition::Remove;
            }
        }
        Disposition::Keep
    }

    fn on_exit(&mut self, outcome: ExitOutcome) {
        tracing::info!(session_id = %self.id, pid = ?self.process.pid(), "Process exited: {}", outcome);
        self.exit = Some(outcome);
        if !self.status.is_terminal() {
            self.status = SessionStatus::Completed;
        }
        self.close_input();
        self.process.cancel_escalation();
        self.monitor.process_exited(Some(outcome));
    }

    fn on_process_error(&mut self, message: &str, config: &BridgeConfig, out: &mut Vec<OutputEvent>) {
        tracing::error!(session_id = %self.id, pid = ?self.process.pid(), "Process error: {}", message);
        out.push(OutputEvent::error(
            &self.id,
            message,
            EventErrorCode::ProcessError,
        ));
        self.status = SessionStatus::Error;
        self.close_input();
        self.monitor.process_error(message);
        // The exit will never be reported now; let the streams finish termination.
        self.monitor.process_exited(None);
        self.timers.arm(TimerKind::Removal, config.removal_grace);
    }

    fn on_terminated(
        &mut self,
        exit: Option<ExitOutcome>,
        config: &BridgeConfig,
        out: &mut Vec<OutputEvent>,
    ) {
        if self.status == SessionStatus::Terminated {
            return;
        }
        self.flush_fragments(config, out);
        self.finish_init(out);
        if let Some(paragraph) = self.paragraphs.flush() {
            self.emit_paragraph(paragraph, out);
        }

        let exit = exit.or(self.exit);
        tracing::info!(session_id = %self.id, "Session terminated ({:?})", exit);
        out.push(OutputEvent::Complete {
            session_id: self.id.clone(),
            exit_code: exit.and_then(|e| e.code()),
        });

        self.status = SessionStatus::Terminated;
        self.teardown();
        self.timers.arm(TimerKind::Removal, config.removal_grace);
    }

    fn on_timeout(&mut self, reason: &TimeoutReason, out: &mut Vec<OutputEvent>) {
        tracing::warn!(session_id = %self.id, "Termination timeout: {}", reason);
        out.push(OutputEvent::info(
            &self.id,
            format!("Termination timeout: {reason}"),
            InfoType::Status,
        ));
    }
}

/// Why input was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputRejected {
    Terminal(SessionStatus),
    Closed,
}
