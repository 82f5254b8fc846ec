//! Shared protocol definitions for worker ↔ relay and worker ↔ worker traffic.
//! Keeping these in a dedicated crate lets the relay build without pulling in
//! the WebRTC stack the workers depend on.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod envelope;
pub mod signal;

pub use envelope::{Response, SimpleReply, SimpleRequest};
pub use signal::{ConnectReply, ConnectRequest, RefusalReason, SignalMessage};

/// Opaque identifier of a participant, stable for the lifetime of its process.
pub type WorkerId = String;

/// Status the relay answers a successful registration with.
pub const REGISTER_OK: &str = "ok";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// Negotiation blob produced by a transport provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One STUN/TURN entry handed verbatim to the transport provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid signaling frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid data channel frame: {0}")]
    Binary(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_server_omits_missing_credentials() {
        let json = serde_json::to_string(&IceServerConfig::new("stun:stun.l.google.com:19302"))
            .expect("serialize");
        assert_eq!(json, r#"{"url":"stun:stun.l.google.com:19302"}"#);

        let turn: IceServerConfig = serde_json::from_str(
            r#"{"url":"turn:relay.example:3478","username":"u","credential":"c"}"#,
        )
        .expect("deserialize");
        assert_eq!(
            turn,
            IceServerConfig::new("turn:relay.example:3478").with_credentials("u", "c")
        );
    }
}
