//! Boundary to the connectivity engine that turns an offer/answer exchange
//! into a live link carrying data channels.
//!
//! Two providers ship with the crate: [`webrtc::WebRtcProvider`] for real
//! deployments and [`memory::MemoryNetwork`] for in-process links.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fleece_proto::{IceServerConfig, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::NetworkError;

pub mod memory;
pub mod webrtc;

pub use memory::{MemoryNetwork, MemoryProvider};
pub use webrtc::WebRtcProvider;

/// Connectivity as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications raised by a transport after creation.
pub enum TransportEvent {
    /// The remote side opened a data channel on this transport.
    DataChannel(Arc<dyn DataChannel>),
    StateChange(LinkState),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            TransportEvent::StateChange(state) => f.debug_tuple("StateChange").field(state).finish(),
        }
    }
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Closed,
}

#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Allocates a fresh transport object. Events for it are delivered on
    /// `events` until the transport is closed.
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: TransportEvents,
    ) -> Result<Arc<dyn RtcTransport>, NetworkError>;
}

#[async_trait]
pub trait RtcTransport: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NetworkError>;

    async fn create_offer(&self) -> Result<SessionDescription, NetworkError>;

    async fn create_answer(&self) -> Result<SessionDescription, NetworkError>;

    /// Applies the local description. Returns once candidate gathering is
    /// complete, so [`Self::local_description`] is ready to hand out.
    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), NetworkError>;

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), NetworkError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<(), NetworkError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, data: Bytes) -> Result<(), NetworkError>;

    /// Hands out the event stream of this channel. Only the first caller
    /// receives it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self);
}

/// Event stream slot shared by the provider implementations.
pub(crate) struct EventSlot {
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl EventSlot {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<ChannelEvent> {
        self.tx.clone()
    }

    pub(crate) fn emit(&self, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn take(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.rx.lock().take()
    }
}
