//! Error types for the tether runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Protocol-level desynchronization (malformed frame, unknown correlation
    /// id, unknown object type). Fatal to the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error reported by the engine for a specific call.
    #[error("{name}: {message}")]
    Remote {
        /// Error type name as reported by the engine (e.g. "TimeoutError").
        name: String,
        /// Human-readable message.
        message: String,
        /// Engine-side stack trace, if available.
        stack: Option<String>,
    },

    /// Timed out waiting for an event or operation.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The connection was torn down; carries the cause.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// A call was issued through a proxy that is already disposed.
    #[error("{type_name} '{guid}' is disposed")]
    ObjectDisposed { type_name: String, guid: String },

    /// A referenced object is not in the registry.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// A locally-executed binding function failed.
    #[error("binding call failed: {0}")]
    BindingFailed(String),

    /// Transport-level failure below the message boundary.
    #[error("transport error: {0}")]
    Transport(String),

    /// The engine process could not be started.
    #[error("failed to launch engine: {0}")]
    LaunchFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error name if this is an engine-reported error.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Returns the engine-side stack trace, if any.
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Error::Remote { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }

    /// Returns true if this is a timeout, local or engine-reported.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Remote { name, .. } => name == "TimeoutError",
            _ => false,
        }
    }

    /// Returns true if the failure was a call through a disposed proxy.
    pub fn is_disposed(&self) -> bool {
        matches!(self, Error::ObjectDisposed { .. })
    }
}
