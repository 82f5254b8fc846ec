use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::CodecError;

/// Reply body produced by a handler, modeled after an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

impl Response {
    pub const OK: u16 = 200;
    pub const NOT_FOUND: u16 = 404;
    pub const UNPROCESSABLE: u16 = 422;
    pub const INTERNAL: u16 = 500;

    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(Self::OK, body)
    }

    pub fn empty() -> Self {
        Self::new(Self::OK, Bytes::new())
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::ok(serde_json::to_vec(value)?))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn decode_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<String> for Response {
    fn from(body: String) -> Self {
        Self::ok(body)
    }
}

impl From<&str> for Response {
    fn from(body: &str) -> Self {
        Self::ok(Bytes::copy_from_slice(body.as_bytes()))
    }
}

impl From<()> for Response {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Response {
    fn from(body: Bytes) -> Self {
        Self::ok(body)
    }
}

impl From<Vec<u8>> for Response {
    fn from(body: Vec<u8>) -> Self {
        Self::ok(body)
    }
}

/// Request envelope carried on a data channel. `id` is scoped to the
/// outward channel that allocated it and is echoed back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleRequest {
    pub id: u64,
    pub op: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleReply {
    pub id: u64,
    pub data: Response,
}

impl SimpleRequest {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl SimpleReply {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
