//! In-process transport: every transport created through a [`MemoryNetwork`]
//! lives in one shared hub, and session descriptions are just tokens naming
//! a transport in that hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use fleece_proto::{IceServerConfig, SdpKind, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    ChannelEvent, DataChannel, EventSlot, LinkState, RtcTransport, TransportEvent,
    TransportEvents, TransportProvider,
};
use crate::error::NetworkError;

const OFFER_PREFIX: &str = "memory-offer:";
const ANSWER_PREFIX: &str = "memory-answer:";

/// Shared hub for in-process transports. Clones refer to the same hub, so
/// several peers built on one network can reach each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    transports: Mutex<HashMap<Uuid, Arc<MemoryTransport>>>,
    created: AtomicUsize,
}

impl Hub {
    fn lookup(&self, id: &Uuid) -> Option<Arc<MemoryTransport>> {
        self.transports.lock().get(id).cloned()
    }

    fn forget(&self, id: &Uuid) {
        self.transports.lock().remove(id);
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider(&self) -> Arc<MemoryProvider> {
        Arc::new(MemoryProvider {
            network: self.clone(),
        })
    }

    /// Number of transports ever allocated on this network.
    pub fn transports_created(&self) -> usize {
        self.hub.created.load(Ordering::SeqCst)
    }

    /// Number of transport pairs currently linked.
    pub fn open_links(&self) -> usize {
        let linked = self
            .hub
            .transports
            .lock()
            .values()
            .filter(|transport| transport.is_linked())
            .count();
        linked / 2
    }

    /// Breaks every live link as if connectivity was lost: both ends report
    /// `Failed` and all of their data channels close.
    pub fn sever_all(&self) {
        let transports: Vec<_> = self.hub.transports.lock().values().cloned().collect();
        for transport in transports {
            if transport.is_linked() {
                transport.sever();
            }
        }
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("transports_created", &self.transports_created())
            .field("open_links", &self.open_links())
            .finish()
    }
}

pub struct MemoryProvider {
    network: MemoryNetwork,
}

impl MemoryProvider {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl TransportProvider for MemoryProvider {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: TransportEvents,
    ) -> Result<Arc<dyn RtcTransport>, NetworkError> {
        let hub = Arc::clone(&self.network.hub);
        let transport = Arc::new(MemoryTransport {
            id: Uuid::new_v4(),
            hub: Arc::downgrade(&hub),
            events,
            inner: Mutex::new(TransportInner::default()),
        });
        hub.transports
            .lock()
            .insert(transport.id, Arc::clone(&transport));
        hub.created.fetch_add(1, Ordering::SeqCst);
        trace!(target: "memory_transport", id = %transport.id, "transport created");
        Ok(transport)
    }
}

struct MemoryTransport {
    id: Uuid,
    hub: Weak<Hub>,
    events: TransportEvents,
    inner: Mutex<TransportInner>,
}

#[derive(Default)]
struct TransportInner {
    local: Option<SessionDescription>,
    /// Transport named by the remote description, once applied.
    remote: Option<Uuid>,
    /// Channels created on this side.
    channels: Vec<Arc<MemoryDataChannel>>,
    /// Ends of channels the remote side created.
    attached: Vec<Arc<MemoryDataChannel>>,
    link: Option<Weak<MemoryTransport>>,
    closed: bool,
}

impl MemoryTransport {
    fn is_linked(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed && inner.link.is_some()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn token(&self, kind: SdpKind) -> SessionDescription {
        match kind {
            SdpKind::Offer => SessionDescription::offer(format!("{OFFER_PREFIX}{}", self.id)),
            SdpKind::Answer => SessionDescription::answer(format!("{ANSWER_PREFIX}{}", self.id)),
        }
    }

    fn lookup(&self, id: &Uuid) -> Result<Arc<MemoryTransport>, NetworkError> {
        self.hub
            .upgrade()
            .and_then(|hub| hub.lookup(id))
            .ok_or_else(|| NetworkError::Transport(format!("no memory transport {id}")))
    }

    /// Offerer side of the link: pairs every channel on both ends, then
    /// reports connectivity to both.
    fn link_with(self: &Arc<Self>, answerer: Arc<MemoryTransport>) -> Result<(), NetworkError> {
        let mine = {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(NetworkError::Transport("transport is closed".into()));
            }
            inner.channels.clone()
        };
        let theirs = {
            let inner = answerer.inner.lock();
            if inner.closed {
                return Err(NetworkError::Transport("remote transport is closed".into()));
            }
            if inner.remote != Some(self.id) {
                return Err(NetworkError::Transport(
                    "answer does not belong to this offer".into(),
                ));
            }
            inner.channels.clone()
        };

        let attach = |local: &[Arc<MemoryDataChannel>], remote: &Arc<MemoryTransport>| {
            let ends: Vec<_> = local
                .iter()
                .map(|channel| {
                    let end = MemoryDataChannel::new(channel.label.clone());
                    MemoryDataChannel::pair(channel, &end);
                    end
                })
                .collect();
            remote.inner.lock().attached.extend(ends.iter().cloned());
            ends
        };
        let at_answerer = attach(&mine, &answerer);
        let at_offerer = attach(&theirs, self);

        self.inner.lock().link = Some(Arc::downgrade(&answerer));
        answerer.inner.lock().link = Some(Arc::downgrade(self));

        for end in &at_answerer {
            answerer.emit(TransportEvent::DataChannel(end.clone()));
        }
        for end in &at_offerer {
            self.emit(TransportEvent::DataChannel(end.clone()));
        }
        for channel in mine.iter().chain(&theirs).chain(&at_answerer).chain(&at_offerer) {
            channel.events.emit(ChannelEvent::Open);
        }
        self.emit(TransportEvent::StateChange(LinkState::Connected));
        answerer.emit(TransportEvent::StateChange(LinkState::Connected));
        debug!(
            target: "memory_transport",
            offerer = %self.id,
            answerer = %answerer.id,
            "memory link established"
        );
        Ok(())
    }

    fn sever(&self) {
        let peer = self.inner.lock().link.take().and_then(|link| link.upgrade());
        self.fail(LinkState::Failed);
        if let Some(peer) = peer {
            peer.inner.lock().link = None;
            peer.fail(LinkState::Failed);
        }
    }

    /// Closes every channel end on this side and reports `state`.
    fn fail(&self, state: LinkState) {
        let channels: Vec<_> = {
            let inner = self.inner.lock();
            inner.channels.iter().chain(&inner.attached).cloned().collect()
        };
        for channel in channels {
            channel.shutdown();
        }
        self.emit(TransportEvent::StateChange(state));
    }

    fn mark_closed(&self) -> bool {
        let was_closed = std::mem::replace(&mut self.inner.lock().closed, true);
        if let Some(hub) = self.hub.upgrade() {
            hub.forget(&self.id);
        }
        !was_closed
    }
}

#[async_trait]
impl RtcTransport for MemoryTransport {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NetworkError> {
        let channel = MemoryDataChannel::new(label.to_string());
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(NetworkError::Transport("transport is closed".into()));
        }
        inner.channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, NetworkError> {
        Ok(self.token(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NetworkError> {
        if self.inner.lock().remote.is_none() {
            return Err(NetworkError::Transport(
                "cannot answer before the remote offer is applied".into(),
            ));
        }
        Ok(self.token(SdpKind::Answer))
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), NetworkError> {
        self.inner.lock().local = Some(sdp);
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), NetworkError> {
        let remote_id = parse_token(&sdp)?;
        let remote = self.lookup(&remote_id)?;
        match sdp.kind {
            SdpKind::Offer => {
                self.inner.lock().remote = Some(remote_id);
                Ok(())
            }
            SdpKind::Answer => {
                // `self` was handed out as an `Arc` by the provider; the hub
                // holds the same allocation.
                let this = self.lookup(&self.id)?;
                this.inner.lock().remote = Some(remote_id);
                this.link_with(remote)
            }
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    async fn close(&self) -> Result<(), NetworkError> {
        if !self.mark_closed() {
            return Ok(());
        }
        let peer = self.inner.lock().link.take().and_then(|link| link.upgrade());
        self.fail(LinkState::Closed);
        if let Some(peer) = peer {
            peer.inner.lock().link = None;
            if peer.mark_closed() {
                peer.fail(LinkState::Closed);
            }
        }
        trace!(target: "memory_transport", id = %self.id, "transport closed");
        Ok(())
    }
}

fn parse_token(sdp: &SessionDescription) -> Result<Uuid, NetworkError> {
    let prefix = match sdp.kind {
        SdpKind::Offer => OFFER_PREFIX,
        SdpKind::Answer => ANSWER_PREFIX,
    };
    sdp.sdp
        .strip_prefix(prefix)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| NetworkError::Transport(format!("not a memory {} token", sdp.kind)))
}

struct MemoryDataChannel {
    label: String,
    events: EventSlot,
    peer: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    closed: AtomicBool,
}

impl MemoryDataChannel {
    fn new(label: String) -> Arc<Self> {
        Arc::new(Self {
            label,
            events: EventSlot::new(),
            peer: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Some(b.events.sender());
        *b.peer.lock() = Some(a.events.sender());
    }

    /// Closes this end and tells the other end.
    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(peer) = self.peer.lock().take() {
            let _ = peer.send(ChannelEvent::Closed);
        }
        self.events.emit(ChannelEvent::Closed);
    }
}

#[async_trait]
impl DataChannel for MemoryDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<(), NetworkError> {
        let peer = self.peer.lock();
        match peer.as_ref() {
            Some(peer) if !self.closed.load(Ordering::SeqCst) => peer
                .send(ChannelEvent::Message(data))
                .map_err(|_| NetworkError::ChannelClosed {
                    label: self.label.clone(),
                }),
            _ => Err(NetworkError::ChannelClosed {
                label: self.label.clone(),
            }),
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }

    async fn close(&self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn negotiate(
        network: &MemoryNetwork,
    ) -> (
        Arc<dyn RtcTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
        Arc<dyn DataChannel>,
        Arc<dyn RtcTransport>,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let provider = network.provider();
        let (offer_tx, offer_rx) = mpsc::unbounded_channel();
        let (answer_tx, answer_rx) = mpsc::unbounded_channel();
        let offerer = provider.create(&[], offer_tx).await.expect("offerer");
        let answerer = provider.create(&[], answer_tx).await.expect("answerer");

        let channel = offerer.create_data_channel("a").await.expect("channel");
        let offer = offerer.create_offer().await.expect("offer");
        offerer.set_local_description(offer.clone()).await.expect("local");
        answerer.set_remote_description(offer).await.expect("remote offer");
        let answer = answerer.create_answer().await.expect("answer");
        answerer.set_local_description(answer.clone()).await.expect("local");
        offerer.set_remote_description(answer).await.expect("remote answer");
        (offerer, offer_rx, channel, answerer, answer_rx)
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn applying_answer_links_both_sides() {
        let network = MemoryNetwork::new();
        let (_offerer, mut offer_rx, channel, _answerer, mut answer_rx) =
            negotiate(&network).await;
        assert_eq!(network.transports_created(), 2);
        assert_eq!(network.open_links(), 1);

        let Some(TransportEvent::DataChannel(remote)) = answer_rx.recv().await else {
            panic!("answerer should see the offerer's channel");
        };
        assert_eq!(remote.label(), "a");
        assert!(matches!(
            answer_rx.recv().await,
            Some(TransportEvent::StateChange(LinkState::Connected))
        ));
        assert!(matches!(
            offer_rx.recv().await,
            Some(TransportEvent::StateChange(LinkState::Connected))
        ));

        let mut local_events = channel.take_events().expect("local events");
        let mut remote_events = remote.take_events().expect("remote events");
        assert!(channel.take_events().is_none());
        assert_eq!(local_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Open));

        channel.send(Bytes::from_static(b"ping")).await.expect("send");
        assert_eq!(
            remote_events.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"ping")))
        );
        remote.send(Bytes::from_static(b"pong")).await.expect("reply");
        assert_eq!(
            local_events.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"pong")))
        );
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn sever_fails_both_ends() {
        let network = MemoryNetwork::new();
        let (_offerer, mut offer_rx, channel, _answerer, mut answer_rx) =
            negotiate(&network).await;
        let mut local_events = channel.take_events().expect("events");
        network.sever_all();
        assert_eq!(network.open_links(), 0);

        let mut offer_states = Vec::new();
        while let Ok(TransportEvent::StateChange(state)) = offer_rx.try_recv() {
            offer_states.push(state);
        }
        assert_eq!(offer_states.last(), Some(&LinkState::Failed));
        let mut saw_failed = false;
        while let Ok(event) = answer_rx.try_recv() {
            if let TransportEvent::StateChange(LinkState::Failed) = event {
                saw_failed = true;
            }
        }
        assert!(saw_failed);

        assert_eq!(local_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(local_events.recv().await, Some(ChannelEvent::Closed));
        assert!(channel.send(Bytes::new()).await.is_err());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn close_reaches_remote() {
        let network = MemoryNetwork::new();
        let (offerer, _offer_rx, _channel, _answerer, mut answer_rx) =
            negotiate(&network).await;
        offerer.close().await.expect("close");
        offerer.close().await.expect("close twice");
        assert_eq!(network.open_links(), 0);

        let mut last = None;
        while let Ok(event) = answer_rx.try_recv() {
            if let TransportEvent::StateChange(state) = event {
                last = Some(state);
            }
        }
        assert_eq!(last, Some(LinkState::Closed));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn foreign_tokens_are_rejected() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = network.provider().create(&[], tx).await.expect("transport");
        assert!(transport.create_answer().await.is_err());
        assert!(transport
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .is_err());
        assert!(transport
            .set_remote_description(SessionDescription::offer(format!(
                "{OFFER_PREFIX}{}",
                Uuid::new_v4()
            )))
            .await
            .is_err());
    }
}
