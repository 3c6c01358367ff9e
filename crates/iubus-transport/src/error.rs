//! Error types for the transport layer.

use thiserror::Error;

use iubus_core::CoreError;

/// Errors that can occur while publishing, subscribing or calling.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No RPC server is registered at the scope.
    #[error("no server at scope {0}")]
    NoServer(String),

    /// The RPC did not complete in time.
    #[error("rpc to {scope} timed out after {timeout_ms} ms")]
    Timeout { scope: String, timeout_ms: u128 },

    /// The peer went away while a call was in flight.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A delivery or server thread could not be started.
    #[error("spawn error: {0}")]
    Spawn(String),

    /// Message encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CoreError),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
