//! Error types for IU and buffer operations.

use thiserror::Error;

use iubus_core::CoreError;
use iubus_transport::TransportError;

/// Errors surfaced by the public IU and buffer API.
#[derive(Debug, Error)]
pub enum IuError {
    #[error("IU {0} is already published")]
    AlreadyPublished(String),

    #[error("IU already has uid {0}")]
    AlreadyHasUid(String),

    #[error("IU {0} already has an owner")]
    AlreadyHasOwner(String),

    #[error("IU {0} is already resident in a buffer")]
    AlreadyInABuffer(String),

    #[error("IU {0} is committed")]
    Committed(String),

    #[error("IU {0} is retracted")]
    Retracted(String),

    #[error("IU {0} is read-only")]
    ReadOnly(String),

    #[error("IU {0} is not published")]
    Unpublished(String),

    /// The owner rejected a remote write (stale revision or terminal IU).
    #[error("remote update of IU {0} was rejected")]
    UpdateFailed(String),

    #[error("resend request for IU {uid} failed: {reason}")]
    ResendRequestFailed { uid: String, reason: String },

    #[error("addressing error: {0}")]
    AddressingError(String),

    #[error("type conversion error: cannot convert {value} to {target}")]
    TypeConversion { value: String, target: &'static str },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Another thread held the payload batch scope for too long.
    #[error("timed out waiting for the payload batch of IU {0}")]
    PayloadLockTimeout(String),

    /// A component notifier cannot be restarted once terminated.
    #[error("component {0} was terminated")]
    ComponentTerminated(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<CoreError> for IuError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::AddressingError(msg) => IuError::AddressingError(msg),
            CoreError::TypeConversion { value, target } => IuError::TypeConversion { value, target },
            CoreError::NotImplemented(msg) => IuError::NotImplemented(msg),
            e @ (CoreError::EncodingError(_) | CoreError::DecodingError(_)) => {
                IuError::Transport(TransportError::Codec(e))
            }
        }
    }
}

/// Result type for IU and buffer operations.
pub type Result<T> = std::result::Result<T, IuError>;
