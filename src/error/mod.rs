use std::fmt::Display;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// The unified error type for qchat-bridge
///
/// Only start-up validation failures are returned to callers of the session
/// service; everything raised while a session is running is converted into an
/// `error` event instead.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Session error: {message}")]
    Session {
        code: u16,
        message: String,
        session_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Process error: {message}")]
    Process {
        code: u16,
        message: String,
        command: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] {message}")]
    Other {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl BridgeError {
    /// Create a configuration error with default code
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            code: ErrorCode::CONFIG_GENERIC,
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with specific code
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a session error with specific code and session ID
    pub fn session_with_code(
        code: u16,
        message: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        Self::Session {
            code,
            message: message.into(),
            session_id,
            source: None,
        }
    }

    /// Shorthand for a missing session
    pub fn session_not_found(session_id: impl Display) -> Self {
        Self::session_with_code(
            ErrorCode::SESSION_NOT_FOUND,
            format!("Session not found: {session_id}"),
            Some(session_id.to_string()),
        )
    }

    /// Create a process error with specific code
    pub fn process_with_code(
        code: u16,
        message: impl Into<String>,
        command: Option<String>,
    ) -> Self {
        Self::Process {
            code,
            message: message.into(),
            command,
            source: None,
        }
    }

    /// Create a generic other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            code: ErrorCode::OTHER_GENERIC,
            message: message.into(),
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. }
            | Self::Session { source: src, .. }
            | Self::Process { source: src, .. }
            | Self::Other { source: src, .. } => {
                *src = Some(source.into());
            }
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Config { message, .. }
            | Self::Session { message, .. }
            | Self::Process { message, .. }
            | Self::Other { message, .. } => {
                *message = format!("{}: {}", message, context);
            }
        }
        self
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. }
            | Self::Session { code, .. }
            | Self::Process { code, .. }
            | Self::Other { code, .. } => *code,
        }
    }

    /// True for failures that happen before a session is registered
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::SESSION_INVALID_PATH
                | ErrorCode::SESSION_CLI_UNAVAILABLE
                | ErrorCode::EXEC_SPAWN_FAILED
                | ErrorCode::EXEC_TIMEOUT
                | ErrorCode::EXEC_COMMAND_NOT_FOUND
        )
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Self::Config { message, .. } => format!("Configuration problem: {}", message),
            Self::Session {
                message,
                session_id,
                ..
            } => {
                if let Some(id) = session_id {
                    format!("Session {} error: {}", id, message)
                } else {
                    format!("Session error: {}", message)
                }
            }
            Self::Process {
                message, command, ..
            } => {
                if let Some(cmd) = command {
                    format!("Command '{}' failed: {}", cmd, message)
                } else {
                    format!("Process error: {}", message)
                }
            }
            Self::Other { message, .. } => message.clone(),
        }
    }
}

/// Type alias for Results using BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = BridgeError::session_not_found("session_1_abc");
        assert_eq!(err.code(), ErrorCode::SESSION_NOT_FOUND);
        assert!(err.to_string().starts_with("[E2001]"));
        assert!(err.user_message().contains("session_1_abc"));
    }

    #[test]
    fn test_with_context_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = BridgeError::process_with_code(
            ErrorCode::EXEC_SPAWN_FAILED,
            "spawn failed",
            Some("q chat".to_string()),
        )
        .with_source(io)
        .with_context("while starting");

        assert!(err.to_string().contains("spawn failed: while starting"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.is_startup_failure());
    }

    #[test]
    fn test_runtime_errors_are_not_startup_failures() {
        let err = BridgeError::session_with_code(ErrorCode::SESSION_INPUT_CLOSED, "closed", None);
        assert!(!err.is_startup_failure());
    }
}
