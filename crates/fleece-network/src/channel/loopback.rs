use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fleece_proto::Response;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::pending::{wait_reply, PendingReplies};
use super::{Connection, Inward, Outward};
use crate::error::NetworkError;
use crate::handler::HandlerRegistry;

type LoopRequest = (u64, String, Bytes);
type LoopReply = (u64, Response);

/// Outward end of the in-process channel pair. Requests never leave the
/// process and are not serialized.
pub struct OutwardLoopback {
    label: String,
    requests: mpsc::UnboundedSender<LoopRequest>,
    pending: Arc<PendingReplies>,
    pump: JoinHandle<()>,
}

impl OutwardLoopback {
    fn new(
        label: String,
        requests: mpsc::UnboundedSender<LoopRequest>,
        mut replies: mpsc::UnboundedReceiver<LoopReply>,
    ) -> Self {
        let pending = Arc::new(PendingReplies::default());
        let resolver = Arc::clone(&pending);
        let pump = tokio::spawn(async move {
            while let Some((id, response)) = replies.recv().await {
                if !resolver.resolve(id, response) {
                    debug!(id, "dropping loopback reply for unknown request");
                }
            }
            resolver.fail_all();
        });
        Self {
            label,
            requests,
            pending,
            pump,
        }
    }
}

#[async_trait]
impl Outward for OutwardLoopback {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, op: &str, payload: Bytes) -> Result<Response, NetworkError> {
        let closed = || NetworkError::ChannelClosed {
            label: self.label.clone(),
        };
        let (id, slot) = self.pending.register().ok_or_else(closed)?;
        if self.requests.send((id, op.to_string(), payload)).is_err() {
            self.pending.cancel(id);
            return Err(closed());
        }
        debug!(label = %self.label, id, op, "loopback request sent");
        wait_reply(id, slot).await
    }

    fn close(&self) {
        self.pending.fail_all();
        self.pump.abort();
    }
}

impl Drop for OutwardLoopback {
    fn drop(&mut self) {
        self.close();
    }
}

/// Inward end of the in-process channel pair.
pub struct InwardLoopback {
    label: String,
    handlers: HandlerRegistry,
    replies: mpsc::UnboundedSender<LoopReply>,
}

impl InwardLoopback {
    fn spawn(
        label: String,
        handlers: HandlerRegistry,
        mut requests: mpsc::UnboundedReceiver<LoopRequest>,
        replies: mpsc::UnboundedSender<LoopReply>,
    ) -> Arc<Self> {
        let inward = Arc::new(Self {
            label,
            handlers,
            replies,
        });
        let this = Arc::clone(&inward);
        tokio::spawn(async move {
            while let Some((id, op, payload)) = requests.recv().await {
                let this = Arc::clone(&this);
                tokio::spawn(async move {
                    if let Err(err) = this.handle(id, &op, payload).await {
                        warn!(label = %this.label, id, op = %op, error = %err, "loopback reply dropped");
                    }
                });
            }
        });
        inward
    }
}

#[async_trait]
impl Inward for InwardLoopback {
    fn label(&self) -> &str {
        &self.label
    }

    fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    async fn reply(&self, id: u64, response: Response) -> Result<(), NetworkError> {
        self.replies
            .send((id, response))
            .map_err(|_| NetworkError::ChannelClosed {
                label: self.label.clone(),
            })
    }
}

/// Connection a worker uses to call its own handlers.
pub struct SelfConnection {
    outward: OutwardLoopback,
    _inward: Arc<InwardLoopback>,
}

impl SelfConnection {
    /// Builds the channel pair. Must be called within a tokio runtime.
    pub fn new(label: impl Into<String>, handlers: HandlerRegistry) -> Self {
        let label = label.into();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let outward = OutwardLoopback::new(label.clone(), request_tx, reply_rx);
        let inward = InwardLoopback::spawn(label, handlers, request_rx, reply_tx);
        Self {
            outward,
            _inward: inward,
        }
    }

    pub fn outward(&self) -> &OutwardLoopback {
        &self.outward
    }
}

#[async_trait]
impl Connection for SelfConnection {
    async fn send(&self, op: &str, payload: Bytes) -> Result<Response, NetworkError> {
        self.outward.send(op, payload).await
    }
}
