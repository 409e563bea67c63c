//! Ordered termination lifecycle of one child process.
//!
//! The only legal path is
//! `ProcessRunning -> ProcessExited -> StreamsClosing -> FullyTerminated`.
//! Any other requested transition is rejected and leaves the state unchanged.
//! With auto-transition enabled the machine advances on its own once the
//! process has exited and all three streams are closed, whichever came first.

use crate::events::StdioStream;
use crate::subprocess::ExitOutcome;
use crate::timer::TimerHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationPhase {
    ProcessRunning,
    ProcessExited,
    StreamsClosing,
    FullyTerminated,
}

impl TerminationPhase {
    /// The single forward edge out of this phase.
    pub fn next(&self) -> Option<TerminationPhase> {
        match self {
            TerminationPhase::ProcessRunning => Some(TerminationPhase::ProcessExited),
            TerminationPhase::ProcessExited => Some(TerminationPhase::StreamsClosing),
            TerminationPhase::StreamsClosing => Some(TerminationPhase::FullyTerminated),
            TerminationPhase::FullyTerminated => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationPhase::ProcessRunning => "process-running",
            TerminationPhase::ProcessExited => "process-exited",
            TerminationPhase::StreamsClosing => "streams-closing",
            TerminationPhase::FullyTerminated => "fully-terminated",
        }
    }
}

impl std::fmt::Display for TerminationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub from: TerminationPhase,
    pub to: TerminationPhase,
    pub at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

pub type PhaseCallback = Arc<dyn Fn(&TransitionRecord) + Send + Sync>;
pub type TimeoutCallback = Arc<dyn Fn(TerminationPhase) + Send + Sync>;

struct MachineInner {
    phase: TerminationPhase,
    completed_streams: BTreeSet<StdioStream>,
    exit: Option<ExitOutcome>,
    history: Vec<TransitionRecord>,
    auto_transition: bool,
    on_enter: HashMap<TerminationPhase, Vec<PhaseCallback>>,
    on_fully_terminated: Vec<PhaseCallback>,
    fully_terminated_fired: bool,
    state_timers: HashMap<TerminationPhase, TimerHandle>,
    destroyed: bool,
}

/// Non-owning reference to a [`TerminationStateMachine`].
#[derive(Clone)]
pub struct WeakStateMachine {
    inner: Weak<Mutex<MachineInner>>,
}

impl WeakStateMachine {
    pub fn upgrade(&self) -> Option<TerminationStateMachine> {
        self.inner.upgrade().map(|inner| TerminationStateMachine { inner })
    }
}

/// Shared handle to the termination state of one process.
#[derive(Clone)]
pub struct TerminationStateMachine {
    inner: Arc<Mutex<MachineInner>>,
}

impl TerminationStateMachine {
    pub fn new(auto_transition: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MachineInner {
                phase: TerminationPhase::ProcessRunning,
                completed_streams: BTreeSet::new(),
                exit: None,
                history: Vec::new(),
                auto_transition,
                on_enter: HashMap::new(),
                on_fully_terminated: Vec::new(),
                fully_terminated_fired: false,
                state_timers: HashMap::new(),
                destroyed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn downgrade(&self) -> WeakStateMachine {
        WeakStateMachine {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn phase(&self) -> TerminationPhase {
        self.lock().phase
    }

    pub fn is_fully_terminated(&self) -> bool {
        self.phase() == TerminationPhase::FullyTerminated
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.lock().exit
    }

    pub fn completed_streams(&self) -> BTreeSet<StdioStream> {
        self.lock().completed_streams.clone()
    }

    pub fn streams_complete(&self) -> bool {
        self.lock().completed_streams.len() == StdioStream::ALL.len()
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.lock().history.clone()
    }

    /// Run `callback` every time `phase` is entered.
    pub fn on_enter(
        &self,
        phase: TerminationPhase,
        callback: impl Fn(&TransitionRecord) + Send + Sync + 'static,
    ) {
        self.lock()
            .on_enter
            .entry(phase)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Run `callback` once, when `FullyTerminated` is reached.
    pub fn on_fully_terminated(&self, callback: impl Fn(&TransitionRecord) + Send + Sync + 'static) {
        self.lock().on_fully_terminated.push(Arc::new(callback));
    }

    /// Apply the transition to `target` if it is the forward edge from the
    /// current phase. Returns false, leaving the state unchanged, otherwise.
    pub fn transition_to(&self, target: TerminationPhase, metadata: serde_json::Value) -> bool {
        if !self.apply(target, metadata) {
            return false;
        }
        self.advance();
        true
    }

    fn apply(&self, target: TerminationPhase, metadata: serde_json::Value) -> bool {
        let (record, callbacks) = {
            let mut inner = self.lock();
            let from = inner.phase;
            if inner.destroyed || from.next() != Some(target) {
                tracing::debug!("Rejected termination transition {} -> {}", from, target);
                return false;
            }

            inner.phase = target;
            inner.state_timers.remove(&from);
            let record = TransitionRecord {
                from,
                to: target,
                at: Utc::now(),
                metadata,
            };
            inner.history.push(record.clone());

            let mut callbacks = inner.on_enter.get(&target).cloned().unwrap_or_default();
            if target == TerminationPhase::FullyTerminated && !inner.fully_terminated_fired {
                inner.fully_terminated_fired = true;
                inner.state_timers.clear();
                callbacks.extend(inner.on_fully_terminated.iter().cloned());
            }
            (record, callbacks)
        };

        tracing::debug!("Termination transition {} -> {}", record.from, record.to);
        for callback in &callbacks {
            callback(&record);
        }
        true
    }

    /// Auto-advance through closing to terminated once exit and streams are both done.
    fn advance(&self) {
        loop {
            let (phase, ready) = {
                let inner = self.lock();
                let streams_done = inner.completed_streams.len() == StdioStream::ALL.len();
                (inner.phase, inner.auto_transition && !inner.destroyed && streams_done)
            };
            if !ready {
                return;
            }
            let applied = match phase {
                TerminationPhase::ProcessExited => self.apply(
                    TerminationPhase::StreamsClosing,
                    serde_json::json!({ "trigger": "streams-complete" }),
                ),
                TerminationPhase::StreamsClosing => self.apply(
                    TerminationPhase::FullyTerminated,
                    serde_json::json!({ "trigger": "auto" }),
                ),
                _ => false,
            };
            if !applied {
                return;
            }
        }
    }

    /// The OS reported the process exited. First of exit/close wins.
    pub fn record_exit(&self, outcome: Option<ExitOutcome>) -> bool {
        self.record_process_end("exit", outcome)
    }

    /// The OS reported the process closed. Ignored if exit already fired.
    pub fn record_close(&self, outcome: Option<ExitOutcome>) -> bool {
        self.record_process_end("close", outcome)
    }

    fn record_process_end(&self, source: &str, outcome: Option<ExitOutcome>) -> bool {
        {
            let mut inner = self.lock();
            if inner.phase != TerminationPhase::ProcessRunning || inner.destroyed {
                tracing::trace!("Ignoring process {} after {}", source, inner.phase);
                return false;
            }
            inner.exit = outcome;
        }
        let metadata = serde_json::json!({
            "source": source,
            "exitCode": outcome.and_then(|o| o.code()),
        });
        self.transition_to(TerminationPhase::ProcessExited, metadata)
    }

    /// Record a closed stream. Duplicates are ignored and return false.
    pub fn mark_stream_closed(&self, stream: StdioStream) -> bool {
        {
            let mut inner = self.lock();
            if inner.destroyed || !inner.completed_streams.insert(stream) {
                return false;
            }
        }
        self.advance();
        true
    }

    /// Call `callback` after `timeout` if the machine is still in `phase`.
    ///
    /// Cancelled as soon as the machine leaves `phase`. Returns false unless
    /// the machine is currently in `phase`.
    pub fn set_state_timeout(
        &self,
        phase: TerminationPhase,
        timeout: Duration,
        callback: impl Fn(TerminationPhase) + Send + Sync + 'static,
    ) -> bool {
        let weak = self.downgrade();
        let callback: TimeoutCallback = Arc::new(callback);
        let mut inner = self.lock();
        if inner.destroyed || inner.phase != phase {
            return false;
        }
        let timer = TimerHandle::after(timeout, async move {
            let Some(machine) = weak.upgrade() else {
                return;
            };
            let still_there = {
                let inner = machine.lock();
                !inner.destroyed && inner.phase == phase
            };
            if still_there {
                tracing::warn!("Termination timeout in phase {} after {:?}", phase, timeout);
                callback(phase);
            }
        });
        inner.state_timers.insert(phase, timer);
        true
    }

    /// Cancel every timer and drop all callbacks.
    pub fn destroy(&self) {
        let mut inner = self.lock();
        inner.destroyed = true;
        inner.state_timers.clear();
        inner.on_enter.clear();
        inner.on_fully_terminated.clear();
    }
}

impl std::fmt::Debug for TerminationStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("TerminationStateMachine")
            .field("phase", &inner.phase)
            .field("completed_streams", &inner.completed_streams)
            .field("exit", &inner.exit)
            .finish()
    }
}
