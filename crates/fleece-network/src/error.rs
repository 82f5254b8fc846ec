use fleece_proto::{CodecError, WorkerId};
use thiserror::Error;

/// Failures surfaced to callers of `connect` and `send`.
///
/// Handler faults are not errors at this level: they travel back as a
/// regular [`fleece_proto::Response`] carrying the fault status.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("connection to {peer} is dead")]
    ConnectionDead { peer: WorkerId },
    #[error("connection lost before the reply to request {id} arrived")]
    ConnectionLost { id: u64 },
    #[error("{peer} refused to negotiate")]
    NegotiationRefused { peer: WorkerId },
    #[error("{peer} is not registered with the relay")]
    PeerUnreachable { peer: WorkerId },
    #[error("no relay session available")]
    SignalingUnavailable,
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("channel {label} is closed")]
    ChannelClosed { label: String },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NetworkError {
    /// Whether calling `connect` again may succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, NetworkError::Codec(_) | NetworkError::Config(_))
    }
}

impl From<CodecError> for NetworkError {
    fn from(err: CodecError) -> Self {
        NetworkError::Codec(err.to_string())
    }
}

pub(crate) fn to_transport_error<E: std::fmt::Display>(err: E) -> NetworkError {
    NetworkError::Transport(err.to_string())
}

pub(crate) fn to_signaling_error<E: std::fmt::Display>(err: E) -> NetworkError {
    NetworkError::Signaling(err.to_string())
}
