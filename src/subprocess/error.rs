use crate::error::{BridgeError, ErrorCode};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process did not confirm start within {0:?}")]
    StartTimeout(Duration),

    #[error("Failed to send {signal} to process {pid}: {message}")]
    Signal {
        pid: i32,
        signal: &'static str,
        message: String,
    },

    #[error("Process wait failed: {0}")]
    Wait(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ProcessError> for BridgeError {
    fn from(err: ProcessError) -> Self {
        let (code, command) = match &err {
            ProcessError::CommandNotFound(cmd) => (ErrorCode::EXEC_COMMAND_NOT_FOUND, Some(cmd.clone())),
            ProcessError::SpawnFailed { command, .. } => {
                (ErrorCode::EXEC_SPAWN_FAILED, Some(command.clone()))
            }
            ProcessError::StartTimeout(_) => (ErrorCode::EXEC_TIMEOUT, None),
            ProcessError::Signal { .. } => (ErrorCode::EXEC_SIGNAL_FAILED, None),
            ProcessError::Wait(_) => (ErrorCode::EXEC_GENERIC, None),
            ProcessError::Io(_) => (ErrorCode::EXEC_OUTPUT_ERROR, None),
        };

        BridgeError::process_with_code(code, err.to_string(), command).with_source(err)
    }
}
