use thiserror::Error;

/// Errors surfaced by the relay codec, stream and listener.
///
/// Buffer-sizing variants are caller programming errors and are reported
/// before any transport I/O happens. `ConnectFailed`/`ReconnectFailed` mean a
/// recovery was already attempted and failed; recoverable transport losses
/// are absorbed internally and never reach the caller.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed relay message: {0}")]
    MalformedMessage(String),

    #[error("Read buffer holds {given} bytes, need at least {required}")]
    BufferTooSmall { given: usize, required: usize },

    #[error("Payload of {given} bytes exceeds the {max} byte maximum")]
    PayloadTooLarge { given: usize, max: usize },

    #[error("Data payload must hold at least one byte")]
    EmptyPayload,

    #[error("Relay protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Relay denied the connection: {0}")]
    Denied(String),

    #[error("Relay could not find the backend: {0}")]
    BackendNotFound(String),

    #[error("Failed to connect to the relay: {0}")]
    ConnectFailed(String),

    #[error("Failed to reconnect to the relay: {0}")]
    ReconnectFailed(String),

    #[error("Stream closed by the relay")]
    StreamClosedByPeer,

    #[error("Stream closed by the client")]
    StreamClosedByCaller,
}

impl RelayError {
    /// True for the terminal session-establishment failures a caller may
    /// want to distinguish from plain I/O trouble.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RelayError::MalformedMessage(_)
                | RelayError::ProtocolViolation(_)
                | RelayError::Denied(_)
                | RelayError::BackendNotFound(_)
                | RelayError::ConnectFailed(_)
                | RelayError::ReconnectFailed(_)
        )
    }
}
