// Device query error types and constants

use crate::error::ErrorCode;
use log::warn;
use std::fmt;

/// Device error code constants
///
/// Error code range: 2101-2103
pub struct DeviceErrorCodes {}

impl DeviceErrorCodes {
    /// Device query exceeded the per-call timeout
    pub const TIMEOUT: i32 = 2101;

    /// Device not attached or the bridge tool could not reach it
    pub const UNREACHABLE: i32 = 2102;

    /// Bridge command ran but failed or produced unusable output
    pub const COMMAND_FAILED: i32 = 2103;
}

/// Log a device error with structured context
///
/// Device errors are expected during a drive test (tunnels, USB glitches)
/// and are logged at warn level; they never fail the owning session.
pub fn log_device_error(err: &DeviceError, context: &str) {
    warn!(
        "Device error in {}: code={}, message={}",
        context,
        err.code(),
        err.message()
    );
}

/// Device query errors
///
/// Raised by DeviceLink implementations when a cellular or GPS query fails.
/// Always absorbed at the ingestion boundary as a missing sample half.
///
/// Error code range: 2101-2103
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// Device query exceeded the per-call timeout
    Timeout { device_id: String, timeout_ms: u64 },

    /// Device not attached or the bridge tool could not reach it
    Unreachable { device_id: String },

    /// Bridge command ran but failed or produced unusable output
    CommandFailed { detail: String },
}

impl ErrorCode for DeviceError {
    fn code(&self) -> i32 {
        match self {
            DeviceError::Timeout { .. } => DeviceErrorCodes::TIMEOUT,
            DeviceError::Unreachable { .. } => DeviceErrorCodes::UNREACHABLE,
            DeviceError::CommandFailed { .. } => DeviceErrorCodes::COMMAND_FAILED,
        }
    }

    fn message(&self) -> String {
        match self {
            DeviceError::Timeout {
                device_id,
                timeout_ms,
            } => {
                format!("Query to device {} timed out after {}ms", device_id, timeout_ms)
            }
            DeviceError::Unreachable { device_id } => {
                format!("Device {} is unreachable", device_id)
            }
            DeviceError::CommandFailed { detail } => {
                format!("Device command failed: {}", detail)
            }
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceError (code {}): {}", self.code(), self.message())
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::CommandFailed {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_codes() {
        assert_eq!(
            DeviceError::Timeout {
                device_id: "d1".to_string(),
                timeout_ms: 5000
            }
            .code(),
            DeviceErrorCodes::TIMEOUT
        );
        assert_eq!(
            DeviceError::Unreachable {
                device_id: "d1".to_string()
            }
            .code(),
            DeviceErrorCodes::UNREACHABLE
        );
        assert_eq!(
            DeviceError::CommandFailed {
                detail: "x".to_string()
            }
            .code(),
            DeviceErrorCodes::COMMAND_FAILED
        );
    }

    #[test]
    fn test_device_error_messages() {
        let err = DeviceError::Timeout {
            device_id: "R58M123".to_string(),
            timeout_ms: 5000,
        };
        assert!(err.message().contains("5000ms"));
        assert!(err.message().contains("R58M123"));
    }
}
