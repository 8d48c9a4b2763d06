use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid endpoint url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {}s", .0.as_secs())]
    ConnectTimeout(Duration),
}

/// Returned by [`crate::EventClient`] handle methods.
///
/// Failures inside the client never surface here; they degrade to dropped
/// events or a connectivity-down notification. The only error a consumer
/// sees is that the client is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("event client has shut down")]
    Closed,
}
