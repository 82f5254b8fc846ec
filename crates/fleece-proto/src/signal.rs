use serde::{Deserialize, Serialize};

use crate::{CodecError, SessionDescription, WorkerId};

/// Frames exchanged over a worker's relay session. One JSON text frame each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    RegisterRequest { worker_id: WorkerId },
    RegisterReply { status: String },
    ConnectRequest(ConnectRequest),
    ConnectReply(ConnectReply),
}

impl SignalMessage {
    pub fn to_text(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Worker the relay should deliver this frame to, if it is routable.
    pub fn destination(&self) -> Option<&str> {
        match self {
            SignalMessage::ConnectRequest(request) => Some(&request.to_worker_id),
            SignalMessage::ConnectReply(reply) => Some(&reply.to_worker_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::RegisterRequest { .. } => "register_request",
            SignalMessage::RegisterReply { .. } => "register_reply",
            SignalMessage::ConnectRequest(_) => "connect_request",
            SignalMessage::ConnectReply(_) => "connect_reply",
        }
    }
}

/// Offer routed from `from_worker_id` to `to_worker_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub from_worker_id: WorkerId,
    pub to_worker_id: WorkerId,
    pub sdp: SessionDescription,
}

/// Answer to a [`ConnectRequest`]. `sdp: None` means the offer was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectReply {
    pub from_worker_id: WorkerId,
    pub to_worker_id: WorkerId,
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RefusalReason>,
}

impl ConnectReply {
    pub fn accept(from: WorkerId, to: WorkerId, sdp: SessionDescription) -> Self {
        Self {
            from_worker_id: from,
            to_worker_id: to,
            sdp: Some(sdp),
            reason: None,
        }
    }

    /// Refusal the relay hands back to the sender of `request` when nobody is
    /// registered under its destination.
    pub fn unreachable(request: &ConnectRequest) -> Self {
        Self {
            from_worker_id: request.to_worker_id.clone(),
            to_worker_id: request.from_worker_id.clone(),
            sdp: None,
            reason: Some(RefusalReason::Unreachable),
        }
    }

    pub fn refusal_reason(&self) -> Option<RefusalReason> {
        match (&self.sdp, self.reason) {
            (Some(_), _) => None,
            (None, Some(reason)) => Some(reason),
            (None, None) => Some(RefusalReason::Refused),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    /// The relay holds no session for the destination.
    Unreachable,
    /// The destination declined to answer.
    Refused,
}
