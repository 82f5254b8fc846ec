use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use fleece_proto::{Response, SimpleReply, SimpleRequest};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::pending::{wait_reply, PendingReplies};
use super::{Inward, Outward};
use crate::error::NetworkError;
use crate::handler::HandlerRegistry;
use crate::transport::{ChannelEvent, DataChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelStatus {
    Connecting,
    Open,
    Closed,
}

/// Issues requests over a data channel this side created.
pub struct OutwardDataChannel {
    channel: Arc<dyn DataChannel>,
    pending: Arc<PendingReplies>,
    status_tx: Arc<watch::Sender<ChannelStatus>>,
    status: watch::Receiver<ChannelStatus>,
    pump: JoinHandle<()>,
}

impl OutwardDataChannel {
    pub fn new(channel: Arc<dyn DataChannel>) -> Self {
        let pending = Arc::new(PendingReplies::default());
        let (status_tx, status) = watch::channel(ChannelStatus::Connecting);
        let status_tx = Arc::new(status_tx);
        let pump = tokio::spawn(pump_replies(
            channel.label().to_string(),
            channel.take_events(),
            Arc::clone(&pending),
            Arc::clone(&status_tx),
        ));
        Self {
            channel,
            pending,
            status_tx,
            status,
            pump,
        }
    }

    fn closed_error(&self) -> NetworkError {
        NetworkError::ChannelClosed {
            label: self.channel.label().to_string(),
        }
    }

    async fn wait_open(&self) -> Result<(), NetworkError> {
        let mut status = self.status.clone();
        let current = *status
            .wait_for(|status| *status != ChannelStatus::Connecting)
            .await
            .map_err(|_| self.closed_error())?;
        match current {
            ChannelStatus::Open => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    /// Requests still waiting for their reply.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

async fn pump_replies(
    label: String,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    pending: Arc<PendingReplies>,
    status: Arc<watch::Sender<ChannelStatus>>,
) {
    if let Some(mut events) = events {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => {
                    // A channel closed locally stays closed.
                    let opened = status.send_if_modified(|current| {
                        let connecting = *current == ChannelStatus::Connecting;
                        if connecting {
                            *current = ChannelStatus::Open;
                        }
                        connecting
                    });
                    if opened {
                        info!(label = %label, "outward data channel open");
                    }
                }
                ChannelEvent::Message(raw) => match SimpleReply::decode(&raw) {
                    Ok(reply) => {
                        trace!(label = %label, id = reply.id, status = reply.data.status, "reply received");
                        if !pending.resolve(reply.id, reply.data) {
                            debug!(label = %label, id = reply.id, "dropping reply for unknown request");
                        }
                    }
                    Err(err) => warn!(label = %label, error = %err, "undecodable reply frame"),
                },
                ChannelEvent::Closed => break,
            }
        }
    }
    status.send_replace(ChannelStatus::Closed);
    let lost = pending.fail_all();
    warn!(label = %label, lost, "outward data channel closed");
}

#[async_trait]
impl Outward for OutwardDataChannel {
    fn label(&self) -> &str {
        self.channel.label()
    }

    async fn send(&self, op: &str, payload: Bytes) -> Result<Response, NetworkError> {
        self.wait_open().await?;
        let (id, slot) = self.pending.register().ok_or_else(|| self.closed_error())?;
        let frame = SimpleRequest {
            id,
            op: op.to_string(),
            data: payload,
        }
        .encode();
        let sent = match frame {
            Ok(frame) => self.channel.send(Bytes::from(frame)).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = sent {
            self.pending.cancel(id);
            return Err(err);
        }
        debug!(label = self.label(), id, op, "request sent");
        wait_reply(id, slot).await
    }

    fn close(&self) {
        // Wakes senders still waiting for the channel to open; the transport
        // may never report a close for a channel that did not open.
        self.status_tx.send_replace(ChannelStatus::Closed);
        let lost = self.pending.fail_all();
        if lost > 0 {
            debug!(label = self.label(), lost, "failed outstanding requests on close");
        }
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move { channel.close().await });
    }
}

impl Drop for OutwardDataChannel {
    fn drop(&mut self) {
        self.status_tx.send_replace(ChannelStatus::Closed);
        self.pending.fail_all();
        self.pump.abort();
    }
}

/// Serves requests arriving on a data channel the remote side created.
pub struct InwardDataChannel {
    channel: Arc<dyn DataChannel>,
    handlers: HandlerRegistry,
}

impl InwardDataChannel {
    pub fn spawn(channel: Arc<dyn DataChannel>, handlers: HandlerRegistry) -> Arc<Self> {
        let events = channel.take_events();
        let inward = Arc::new(Self { channel, handlers });
        tokio::spawn(pump_requests(Arc::downgrade(&inward), events));
        inward
    }

    pub fn close(&self) {
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move { channel.close().await });
    }
}

async fn pump_requests(
    inward: Weak<InwardDataChannel>,
    events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
) {
    let Some(mut events) = events else {
        return;
    };
    while let Some(event) = events.recv().await {
        let Some(this) = inward.upgrade() else {
            break;
        };
        match event {
            ChannelEvent::Open => info!(label = this.label(), "inward data channel open"),
            ChannelEvent::Message(raw) => match SimpleRequest::decode(&raw) {
                Ok(request) => {
                    tokio::spawn(async move {
                        let SimpleRequest { id, op, data } = request;
                        if let Err(err) = this.handle(id, &op, data).await {
                            warn!(label = this.label(), id, op = %op, error = %err, "failed to send reply");
                        }
                    });
                }
                Err(err) => warn!(label = this.label(), error = %err, "undecodable request frame"),
            },
            ChannelEvent::Closed => {
                warn!(label = this.label(), "inward data channel closed");
                break;
            }
        }
    }
}

#[async_trait]
impl Inward for InwardDataChannel {
    fn label(&self) -> &str {
        self.channel.label()
    }

    fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    async fn reply(&self, id: u64, response: Response) -> Result<(), NetworkError> {
        let frame = SimpleReply { id, data: response }.encode()?;
        self.channel.send(Bytes::from(frame)).await
    }
}
