//! Process supervision for the wrapped chat CLI.
//!
//! [`ProcessLauncher`] is the seam between the session layer and the OS:
//! [`TokioProcessLauncher`] spawns real children, [`MockLauncher`] serves
//! in-memory pipes for tests. [`ProcessSupervisor`] adds the fixed child
//! environment and the start deadline; [`ProcessHandle`] owns signal
//! escalation.

pub mod builder;
pub mod error;
pub mod launcher;
pub mod mock;
pub mod supervisor;

pub use builder::{chat_args, LaunchSpecBuilder};
pub use error::ProcessError;
pub use launcher::{
    ExitFuture, ExitOutcome, InputPipe, KillSignal, LaunchSpec, OutputPipe, ProcessControl,
    ProcessLauncher, SpawnedProcess, TokioProcessLauncher,
};
pub use mock::{MockFailure, MockLauncher, MockProcess};
pub use supervisor::{wait_for_start, ProcessHandle, ProcessIo, ProcessSupervisor};
