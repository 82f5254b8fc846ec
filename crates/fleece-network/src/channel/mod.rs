//! Request/response correlation on top of a message transport.
//!
//! An [`Outward`] end issues requests and waits for the matching reply; an
//! [`Inward`] end dispatches requests to the [`HandlerRegistry`] and answers
//! over the same channel the request arrived on.

use async_trait::async_trait;
use bytes::Bytes;
use fleece_proto::Response;
use tracing::{debug, warn};

use crate::error::NetworkError;
use crate::handler::HandlerRegistry;

mod data_channel;
mod loopback;
mod pending;

pub use data_channel::{InwardDataChannel, OutwardDataChannel};
pub use loopback::{InwardLoopback, OutwardLoopback, SelfConnection};

/// Something requests can be sent through: a peer link or the loopback.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, op: &str, payload: Bytes) -> Result<Response, NetworkError>;
}

#[async_trait]
pub trait Outward: Send + Sync {
    fn label(&self) -> &str;

    /// Sends one request and waits for its reply. There is no internal
    /// deadline; the call fails with `ConnectionLost` if the channel closes
    /// first.
    async fn send(&self, op: &str, payload: Bytes) -> Result<Response, NetworkError>;

    /// Fails every outstanding request right away and releases the channel.
    fn close(&self);
}

#[async_trait]
pub trait Inward: Send + Sync {
    fn label(&self) -> &str;

    fn handlers(&self) -> &HandlerRegistry;

    async fn reply(&self, id: u64, response: Response) -> Result<(), NetworkError>;

    async fn handle(&self, id: u64, op: &str, payload: Bytes) -> Result<(), NetworkError> {
        let response = match self.handlers().lookup(op) {
            Some(handler) => match handler.invoke(payload).await {
                Ok(response) => response,
                Err(fault) => {
                    debug!(label = self.label(), id, op, status = fault.status, "handler fault");
                    fault.into_response()
                }
            },
            None => {
                warn!(label = self.label(), id, op, "no handler registered for operation");
                Response::new(Response::NOT_FOUND, format!("unknown operation: {op}"))
            }
        };
        self.reply(id, response).await
    }
}
