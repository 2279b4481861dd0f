// Streaming error types and constants

use crate::error::ErrorCode;
use std::fmt;

/// Stream error code constants
///
/// Error code range: 2301-2302
pub struct StreamErrorCodes {}

impl StreamErrorCodes {
    /// Subscriber fell behind the bounded per-subscriber buffer
    pub const SLOW_CONSUMER: i32 = 2301;

    /// Stream completed because the session ended
    pub const CLOSED: i32 = 2302;
}

/// Streaming errors
///
/// `SlowConsumer` terminates exactly one subscription; the producer and all
/// sibling subscriptions are unaffected. `Closed` is the normal end-of-stream
/// signal when a session stops and is not a failure.
///
/// Error code range: 2301-2302
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Subscriber fell behind the bounded per-subscriber buffer
    SlowConsumer { missed: u64 },

    /// Stream completed because the session ended
    Closed,
}

impl ErrorCode for StreamError {
    fn code(&self) -> i32 {
        match self {
            StreamError::SlowConsumer { .. } => StreamErrorCodes::SLOW_CONSUMER,
            StreamError::Closed => StreamErrorCodes::CLOSED,
        }
    }

    fn message(&self) -> String {
        match self {
            StreamError::SlowConsumer { missed } => {
                format!(
                    "Subscriber disconnected after falling {} messages behind",
                    missed
                )
            }
            StreamError::Closed => "Stream completed".to_string(),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamError (code {}): {}", self.code(), self.message())
    }
}

impl std::error::Error for StreamError {}
