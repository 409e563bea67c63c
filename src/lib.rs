//! # qchat-bridge
//!
//! Supervises long-lived interactive chat CLI processes (one per session) and turns
//! their ANSI-decorated, line-fragmented terminal output into a structured event stream.
//!
//! ## Modules
//!
//! - `config` - Runtime configuration (timeouts, flush windows, child environment)
//! - `error` - Unified, coded error type
//! - `events` - Output events delivered to the transport layer
//! - `external` - Contracts for the path validator and CLI locator collaborators
//! - `logging` - Tracing subscriber setup for host binaries
//! - `output` - ANSI stripping, line/paragraph assembly, classification, tool and thinking detection
//! - `resources` - Per-session resource sampling
//! - `session` - Session registry, event loop and the public `SessionService`
//! - `subprocess` - Process launching, start confirmation and signal escalation
//! - `termination` - Stdio stream monitor and termination state machine
//! - `timer` - Cancellable one-shot timers
pub mod config;
pub mod error;
pub mod events;
pub mod external;
pub mod logging;
pub mod output;
pub mod resources;
pub mod session;
pub mod subprocess;
pub mod termination;
pub mod timer;

pub mod testing;

pub use config::BridgeConfig;
pub use error::{BridgeError, ErrorCode};
pub use events::{EventSink, InfoType, OutputEvent};
pub use session::{SessionId, SessionService, SessionStatus, StartRequest};
