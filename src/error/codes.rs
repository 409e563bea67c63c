/// Error code registry for qchat-bridge
///
/// Error codes are organized by category:
/// - 1000-1999: Configuration errors
/// - 2000-2999: Session errors
/// - 4000-4999: Process and execution errors
/// - 9000-9999: Other errors
pub struct ErrorCode;

impl ErrorCode {
    // Configuration errors (1000-1999)
    pub const CONFIG_GENERIC: u16 = 1000;
    pub const CONFIG_NOT_FOUND: u16 = 1001;
    pub const CONFIG_PARSE_ERROR: u16 = 1007;
    pub const CONFIG_INVALID_VALUE: u16 = 1005;

    // Session errors (2000-2999)
    pub const SESSION_GENERIC: u16 = 2000;
    pub const SESSION_NOT_FOUND: u16 = 2001;
    pub const SESSION_INVALID_STATE: u16 = 2006;
    pub const SESSION_INVALID_PATH: u16 = 2009;
    pub const SESSION_CLI_UNAVAILABLE: u16 = 2010;
    pub const SESSION_INPUT_CLOSED: u16 = 2011;

    // Process errors (4000-4999)
    pub const EXEC_GENERIC: u16 = 4000;
    pub const EXEC_COMMAND_NOT_FOUND: u16 = 4001;
    pub const EXEC_TIMEOUT: u16 = 4002;
    pub const EXEC_SIGNAL_FAILED: u16 = 4005;
    pub const EXEC_SPAWN_FAILED: u16 = 4007;
    pub const EXEC_OUTPUT_ERROR: u16 = 4008;
    pub const EXEC_STDIN_ERROR: u16 = 4009;

    // Other errors (9000-9999)
    pub const OTHER_GENERIC: u16 = 9000;
    pub const OTHER_INTERNAL_ERROR: u16 = 9004;
}

/// Get a human-readable description for an error code
pub fn describe_error_code(code: u16) -> &'static str {
    match code {
        1000 => "Generic configuration error",
        1001 => "Configuration file not found",
        1005 => "Invalid value in configuration",
        1007 => "Failed to parse configuration",

        2000 => "Generic session error",
        2001 => "Session not found",
        2006 => "Session is in invalid state",
        2009 => "Working directory failed validation",
        2010 => "Chat CLI is not available",
        2011 => "Session no longer accepts input",

        4000 => "Generic process error",
        4001 => "Command not found",
        4002 => "Process did not confirm start in time",
        4005 => "Failed to deliver signal to process",
        4007 => "Failed to spawn subprocess",
        4008 => "Process output error",
        4009 => "Process stdin error",

        9000 => "Generic error",
        9004 => "Internal error",
        _ => "Unknown error code",
    }
}
