//! Client transport errors.

use thiserror::Error;

use crate::message::RpcError;

/// Errors a caller of [`crate::Transport`] can see.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection dropped before a reply arrived. The call's outcome is
    /// unknown; re-issue it after reconnecting.
    #[error("Connection lost")]
    ConnectionLost,

    /// No reply within the call timeout.
    #[error("Timeout waiting for reply")]
    Timeout,

    /// The transport was closed by its owner.
    #[error("Transport closed")]
    Closed,

    /// The scheduler answered with an error reply.
    #[error("Remote error: {0}")]
    Remote(RpcError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
