//! Correlates process exit with stdio completion.
//!
//! Buffered output can still drain after the OS reports the exit, and a child
//! can close its pipes long before it exits, so full termination is detected
//! from either arrival order. Observers are notified synchronously and must
//! not call back into the monitor.

use super::state_machine::{TerminationPhase, TerminationStateMachine};
use super::stdio::StdioMonitor;
use crate::events::StdioStream;
use crate::subprocess::ExitOutcome;
use crate::timer::TimerHandle;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Why a termination timeout fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutReason {
    /// Streams closed but the process did not exit in time
    ProcessNotExited,
    /// The process exited but some streams are still open
    StreamsIncomplete { pending: Vec<StdioStream> },
}

impl std::fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutReason::ProcessNotExited => f.write_str("process-not-exited"),
            TimeoutReason::StreamsIncomplete { pending } => {
                let names: Vec<&str> = pending.iter().map(StdioStream::as_str).collect();
                write!(f, "streams-incomplete ({})", names.join(", "))
            }
        }
    }
}

/// Where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    Process,
    Stream(StdioStream),
}

/// Receives termination notifications.
pub trait TerminationObserver: Send + Sync {
    fn on_process_exited(&self, _exit: Option<ExitOutcome>) {}
    fn on_stream_ended(&self, _stream: StdioStream) {}
    fn on_streams_closed(&self) {}
    /// Called exactly once.
    fn on_fully_terminated(&self, _exit: Option<ExitOutcome>) {}
    fn on_timeout(&self, _reason: &TimeoutReason) {}
    fn on_error(&self, _source: ErrorSource, _message: &str) {}
}

/// Timeouts reported by the monitor; neither blocks eventual termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTimeouts {
    pub stdio_timeout: Duration,
    pub process_exit_timeout: Duration,
}

type Observers = Arc<Mutex<Vec<Arc<dyn TerminationObserver>>>>;

fn snapshot(observers: &Observers) -> Vec<Arc<dyn TerminationObserver>> {
    observers
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

/// Process exit plus three-stream monitor for one child.
#[derive(Clone)]
pub struct ProcessTerminationMonitor {
    machine: TerminationStateMachine,
    stdio: StdioMonitor,
    observers: Observers,
    exit_timer: Arc<Mutex<Option<TimerHandle>>>,
    timeouts: MonitorTimeouts,
}

impl ProcessTerminationMonitor {
    pub fn new(timeouts: MonitorTimeouts) -> Self {
        let monitor = Self {
            machine: TerminationStateMachine::new(true),
            stdio: StdioMonitor::new(),
            observers: Arc::new(Mutex::new(Vec::new())),
            exit_timer: Arc::new(Mutex::new(None)),
            timeouts,
        };
        monitor.wire();
        monitor
    }

    fn exit_timer(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        self.exit_timer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn wire(&self) {
        let observers = Arc::clone(&self.observers);
        self.stdio.on_stream_ended(move |stream| {
            for observer in snapshot(&observers) {
                observer.on_stream_ended(stream);
            }
        });

        let observers = Arc::clone(&self.observers);
        self.stdio.on_error(move |stream, message| {
            for observer in snapshot(&observers) {
                observer.on_error(ErrorSource::Stream(stream), message);
            }
        });

        let observers = Arc::clone(&self.observers);
        let stdio = self.stdio.downgrade();
        let exit_timeout = self.timeouts.stdio_timeout;
        let weak_machine = self.machine.downgrade();
        self.machine
            .on_enter(TerminationPhase::ProcessExited, move |_record| {
                let Some(machine) = weak_machine.upgrade() else {
                    return;
                };
                let exit = machine.exit_outcome();
                for observer in snapshot(&observers) {
                    observer.on_process_exited(exit);
                }
                let observers = Arc::clone(&observers);
                let stdio = stdio.clone();
                machine.set_state_timeout(
                    TerminationPhase::ProcessExited,
                    exit_timeout,
                    move |_| {
                        let pending = stdio
                            .upgrade()
                            .map(|s| s.status().pending.into_iter().collect())
                            .unwrap_or_default();
                        let reason = TimeoutReason::StreamsIncomplete { pending };
                        for observer in snapshot(&observers) {
                            observer.on_timeout(&reason);
                        }
                    },
                );
            });

        let observers = Arc::clone(&self.observers);
        let exit_timer = Arc::clone(&self.exit_timer);
        let weak_machine = self.machine.downgrade();
        self.machine.on_fully_terminated(move |_record| {
            exit_timer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            let exit = weak_machine.upgrade().and_then(|m| m.exit_outcome());
            tracing::debug!("Process fully terminated ({:?})", exit);
            for observer in snapshot(&observers) {
                observer.on_fully_terminated(exit);
            }
        });

        let observers = Arc::clone(&self.observers);
        let exit_timer = Arc::clone(&self.exit_timer);
        let machine = self.machine.clone();
        let process_timeout = self.timeouts.process_exit_timeout;
        self.stdio.on_all_streams_closed(move |_status| {
            for observer in snapshot(&observers) {
                observer.on_streams_closed();
            }
            if machine.phase() != TerminationPhase::ProcessRunning {
                return;
            }
            let observers = Arc::clone(&observers);
            let machine = machine.clone();
            let timer = TimerHandle::after(process_timeout, async move {
                if machine.phase() == TerminationPhase::ProcessRunning {
                    tracing::warn!("Streams closed but process has not exited after {:?}", process_timeout);
                    for observer in snapshot(&observers) {
                        observer.on_timeout(&TimeoutReason::ProcessNotExited);
                    }
                }
            });
            *exit_timer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(timer);
        });
    }

    pub fn add_observer(&self, observer: Arc<dyn TerminationObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(observer);
    }

    /// The OS reported the exit (or the close, whichever came first).
    pub fn process_exited(&self, outcome: Option<ExitOutcome>) -> bool {
        self.machine.record_exit(outcome)
    }

    /// The OS reported a failure concerning the process itself.
    pub fn process_error(&self, message: &str) {
        for observer in snapshot(&self.observers) {
            observer.on_error(ErrorSource::Process, message);
        }
    }

    /// Record end/finish of a stream. Returns false for a duplicate.
    pub fn stream_ended(&self, stream: StdioStream) -> bool {
        if !self.stdio.mark_ended(stream) {
            return false;
        }
        self.machine.mark_stream_closed(stream);
        true
    }

    pub fn stream_error(&self, stream: StdioStream, message: &str) {
        self.stdio.record_error(stream, message);
    }

    pub fn phase(&self) -> TerminationPhase {
        self.machine.phase()
    }

    pub fn is_fully_terminated(&self) -> bool {
        self.machine.is_fully_terminated()
    }

    pub fn state_machine(&self) -> &TerminationStateMachine {
        &self.machine
    }

    pub fn stdio(&self) -> &StdioMonitor {
        &self.stdio
    }

    /// Cancel every timer and drop every callback and observer.
    pub fn destroy(&self) {
        self.exit_timer().take();
        self.stdio.destroy();
        self.machine.destroy();
        self.observers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}
