//! Messages processed by the session event loop.

use super::SessionId;
use crate::events::StdioStream;
use crate::subprocess::ExitOutcome;
use crate::termination::{TerminationObserver, TimeoutReason};
use tokio::sync::mpsc;

/// Timers owned by a session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    StdoutFlush,
    StderrFlush,
    InitFlush,
    Removal,
}

/// Something that happened to a session, queued for the event loop.
#[derive(Debug)]
pub(crate) enum SessionSignal {
    Output(StdioStream, Vec<u8>),
    StreamEnded(StdioStream),
    StreamError(StdioStream, String),
    InputQueued,
    ProcessExited(ExitOutcome),
    ProcessError(String),
    FullyTerminated(Option<ExitOutcome>),
    TerminationTimeout(TimeoutReason),
    Timer(TimerKind, u64),
}

impl SessionSignal {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            SessionSignal::Output(..) => "output",
            SessionSignal::StreamEnded(_) => "stream-ended",
            SessionSignal::StreamError(..) => "stream-error",
            SessionSignal::InputQueued => "input-queued",
            SessionSignal::ProcessExited(_) => "process-exited",
            SessionSignal::ProcessError(_) => "process-error",
            SessionSignal::FullyTerminated(_) => "fully-terminated",
            SessionSignal::TerminationTimeout(_) => "termination-timeout",
            SessionSignal::Timer(..) => "timer",
        }
    }
}

pub(crate) type SignalSender = mpsc::UnboundedSender<(SessionId, SessionSignal)>;
pub(crate) type SignalReceiver = mpsc::UnboundedReceiver<(SessionId, SessionSignal)>;

/// Queue a signal; a closed loop means the service is gone.
pub(crate) fn send(tx: &SignalSender, id: &SessionId, signal: SessionSignal) -> bool {
    if tx.send((id.clone(), signal)).is_err() {
        tracing::trace!(session_id = %id, "Event loop closed; dropping signal");
        return false;
    }
    true
}

/// Forwards termination notifications of one session into the event loop.
pub(crate) struct SignalObserver {
    id: SessionId,
    tx: SignalSender,
}

impl SignalObserver {
    pub(crate) fn new(id: SessionId, tx: SignalSender) -> Self {
        Self { id, tx }
    }
}

impl TerminationObserver for SignalObserver {
    fn on_fully_terminated(&self, exit: Option<ExitOutcome>) {
        send(&self.tx, &self.id, SessionSignal::FullyTerminated(exit));
    }

    fn on_timeout(&self, reason: &TimeoutReason) {
        send(
            &self.tx,
            &self.id,
            SessionSignal::TerminationTimeout(reason.clone()),
        );
    }
}
