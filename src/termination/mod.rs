//! Detection of full process termination.
//!
//! A child counts as terminated only once the OS reported its exit and all
//! three stdio streams have closed. [`ProcessTerminationMonitor`] combines a
//! [`StdioMonitor`] with a [`TerminationStateMachine`] and notifies
//! [`TerminationObserver`]s.

pub mod monitor;
pub mod state_machine;
pub mod stdio;

pub use monitor::{
    ErrorSource, MonitorTimeouts, ProcessTerminationMonitor, TerminationObserver, TimeoutReason,
};
pub use state_machine::{
    TerminationPhase, TerminationStateMachine, TransitionRecord, WeakStateMachine,
};
pub use stdio::{StdioMonitor, StdioMonitorStatus, WeakStdioMonitor};
