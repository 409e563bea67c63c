//! Output events delivered to the transport layer.
//!
//! Events are a closed set; consumers dispatch with an exhaustive `match`.
//! The serialized form uses an `event` tag and camelCase fields so the
//! transport can forward them unchanged.

use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Category of an `info` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoType {
    Initialization,
    Status,
    Progress,
    General,
}

/// Kind of a `response` event. Output is always streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Stream,
}

/// Fixed codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventErrorCode {
    /// The OS reported the child crashed or could not be waited on
    ProcessError,
    /// A stdio pipe failed
    StreamError,
    /// The wrapped CLI reported an error on stderr
    StderrOutput,
    /// The idle sweep terminated the session
    SessionTimeout,
}

/// Which stdio stream an event or error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioStream {
    Stdout,
    Stderr,
    Stdin,
}

impl StdioStream {
    pub const ALL: [StdioStream; 3] = [StdioStream::Stdout, StdioStream::Stderr, StdioStream::Stdin];

    pub fn as_str(&self) -> &'static str {
        match self {
            StdioStream::Stdout => "stdout",
            StdioStream::Stderr => "stderr",
            StdioStream::Stdin => "stdin",
        }
    }
}

impl std::fmt::Display for StdioStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event emitted for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum OutputEvent {
    #[serde(rename = "response")]
    Response {
        session_id: SessionId,
        data: String,
        #[serde(rename = "type")]
        kind: ResponseType,
        tools: Vec<String>,
        has_tool_content: bool,
    },
    #[serde(rename = "info")]
    Info {
        session_id: SessionId,
        message: String,
        #[serde(rename = "type")]
        kind: InfoType,
    },
    #[serde(rename = "error")]
    Error {
        session_id: SessionId,
        error: String,
        code: EventErrorCode,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        source: Option<StdioStream>,
    },
    #[serde(rename = "complete")]
    Complete {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    #[serde(rename = "session:aborted")]
    SessionAborted {
        session_id: SessionId,
        reason: String,
        exit_code: Option<i32>,
    },
}

impl OutputEvent {
    pub fn response(session_id: &SessionId, data: String, tools: Vec<String>) -> Self {
        let has_tool_content = !tools.is_empty();
        Self::Response {
            session_id: session_id.clone(),
            data,
            kind: ResponseType::Stream,
            tools,
            has_tool_content,
        }
    }

    pub fn info(session_id: &SessionId, message: impl Into<String>, kind: InfoType) -> Self {
        Self::Info {
            session_id: session_id.clone(),
            message: message.into(),
            kind,
        }
    }

    pub fn error(session_id: &SessionId, error: impl Into<String>, code: EventErrorCode) -> Self {
        Self::Error {
            session_id: session_id.clone(),
            error: error.into(),
            code,
            source: None,
        }
    }

    pub fn stream_error(
        session_id: &SessionId,
        stream: StdioStream,
        error: impl Into<String>,
    ) -> Self {
        Self::Error {
            session_id: session_id.clone(),
            error: error.into(),
            code: EventErrorCode::StreamError,
            source: Some(stream),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            OutputEvent::Response { session_id, .. }
            | OutputEvent::Info { session_id, .. }
            | OutputEvent::Error { session_id, .. }
            | OutputEvent::Complete { session_id, .. }
            | OutputEvent::SessionAborted { session_id, .. } => session_id,
        }
    }

    /// Wire name of the event, as used by the transport.
    pub fn name(&self) -> &'static str {
        match self {
            OutputEvent::Response { .. } => "response",
            OutputEvent::Info { .. } => "info",
            OutputEvent::Error { .. } => "error",
            OutputEvent::Complete { .. } => "complete",
            OutputEvent::SessionAborted { .. } => "session:aborted",
        }
    }
}

/// Receiver of output events. Implementations must not block and must not
/// call back into the session service.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutputEvent);
}

/// Forwards events into an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<OutputEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutputEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: OutputEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Event receiver dropped; discarding event");
        }
    }
}

/// Keeps every event in memory; useful for tests and diagnostics.
#[derive(Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<OutputEvent>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<OutputEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: OutputEvent) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event);
    }
}
