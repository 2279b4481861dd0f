// Session lifecycle error types and constants

use crate::error::ErrorCode;
use log::error;
use std::fmt;

/// Session error code constants
///
/// Error code range: 2001-2006
pub struct SessionErrorCodes {}

impl SessionErrorCodes {
    /// Device already has a non-terminal capture session
    pub const DEVICE_BUSY: i32 = 2001;

    /// No session exists with the requested id
    pub const NOT_FOUND: i32 = 2002;

    /// Device is not attached or not reachable for capture
    pub const DEVICE_UNREACHABLE: i32 = 2003;

    /// Capture subprocess could not be spawned
    pub const SPAWN_FAILURE: i32 = 2004;

    /// Capture subprocess exited abnormally during capture
    pub const ABNORMAL_EXIT: i32 = 2005;

    /// Session directory or artifact I/O failed
    pub const IO: i32 = 2006;
}

/// Log a session error with structured context
pub fn log_session_error(err: &SessionError, context: &str) {
    error!(
        "Session error in {}: code={}, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Session lifecycle errors
///
/// These errors cover session start/stop and the capture subprocess
/// supervision that drives session state transitions.
///
/// Error code range: 2001-2006
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Device already has a non-terminal capture session
    DeviceBusy { device_id: String },

    /// No session exists with the requested id
    NotFound { session_id: u64 },

    /// Device is not attached or not reachable for capture
    DeviceUnreachable { device_id: String },

    /// Capture subprocess could not be spawned
    SpawnFailure { reason: String },

    /// Capture subprocess exited abnormally during capture
    AbnormalExit {
        code: Option<i32>,
        stderr_tail: Vec<String>,
    },

    /// Session directory or artifact I/O failed
    Io { context: String },
}

impl ErrorCode for SessionError {
    fn code(&self) -> i32 {
        match self {
            SessionError::DeviceBusy { .. } => SessionErrorCodes::DEVICE_BUSY,
            SessionError::NotFound { .. } => SessionErrorCodes::NOT_FOUND,
            SessionError::DeviceUnreachable { .. } => SessionErrorCodes::DEVICE_UNREACHABLE,
            SessionError::SpawnFailure { .. } => SessionErrorCodes::SPAWN_FAILURE,
            SessionError::AbnormalExit { .. } => SessionErrorCodes::ABNORMAL_EXIT,
            SessionError::Io { .. } => SessionErrorCodes::IO,
        }
    }

    fn message(&self) -> String {
        match self {
            SessionError::DeviceBusy { device_id } => {
                format!("Device {} already has an active capture session", device_id)
            }
            SessionError::NotFound { session_id } => {
                format!("No session with id {}", session_id)
            }
            SessionError::DeviceUnreachable { device_id } => {
                format!("Device {} is not attached or not reachable", device_id)
            }
            SessionError::SpawnFailure { reason } => {
                format!("Failed to spawn capture subprocess: {}", reason)
            }
            SessionError::AbnormalExit { code, stderr_tail } => match code {
                Some(code) => format!(
                    "Capture subprocess exited abnormally with code {} ({} stderr lines captured)",
                    code,
                    stderr_tail.len()
                ),
                None => format!(
                    "Capture subprocess was terminated by signal ({} stderr lines captured)",
                    stderr_tail.len()
                ),
            },
            SessionError::Io { context } => {
                format!("Session I/O failed: {}", context)
            }
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionError (code {}): {}", self.code(), self.message())
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io {
            context: err.to_string(),
        }
    }
}
