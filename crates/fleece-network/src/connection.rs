//! Negotiation state of the direct link between this worker and one peer.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use fleece_proto::{
    ConnectReply, ConnectRequest, IceServerConfig, RefusalReason, Response, SdpKind,
    SessionDescription, SignalMessage, WorkerId,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Connection, InwardDataChannel, Outward, OutwardDataChannel};
use crate::error::NetworkError;
use crate::handler::HandlerRegistry;
use crate::signaling::RelaySender;
use crate::transport::{LinkState, RtcTransport, TransportEvent, TransportProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport exists.
    Dead,
    /// A local offer was sent; waiting for the remote answer.
    Offered,
    /// Descriptions were exchanged; waiting for the transport to connect.
    Waiting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Dead => "dead",
            ConnectionState::Offered => "offered",
            ConnectionState::Waiting => "waiting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Relay traffic addressed to one connection, handled in arrival order.
enum Negotiation {
    Offer {
        sdp: SessionDescription,
        relay: RelaySender,
    },
    Reply(ConnectReply),
}

pub struct PeerConnection {
    owner: WorkerId,
    peer: WorkerId,
    ice_servers: Vec<IceServerConfig>,
    provider: Arc<dyn TransportProvider>,
    handlers: HandlerRegistry,
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
    inbox: mpsc::UnboundedSender<Negotiation>,
    this: Weak<PeerConnection>,
}

struct Inner {
    state: ConnectionState,
    transport: Option<Arc<dyn RtcTransport>>,
    /// Bumped for every transport; events tagged with an older value are stale.
    generation: u64,
    outward: Option<Arc<OutwardDataChannel>>,
    inward: Option<Arc<InwardDataChannel>>,
    last_failure: Option<NetworkError>,
}

impl PeerConnection {
    /// Must be called within a tokio runtime.
    pub fn new(
        owner: WorkerId,
        peer: WorkerId,
        ice_servers: Vec<IceServerConfig>,
        provider: Arc<dyn TransportProvider>,
        handlers: HandlerRegistry,
    ) -> Arc<Self> {
        let (inbox, negotiations) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Dead);
        Arc::new_cyclic(|this: &Weak<Self>| {
            tokio::spawn(run_negotiations(this.clone(), negotiations));
            Self {
                owner,
                peer,
                ice_servers,
                provider,
                handlers,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Dead,
                    transport: None,
                    generation: 0,
                    outward: None,
                    inward: None,
                    last_failure: None,
                }),
                state,
                inbox,
                this: this.clone(),
            }
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Starts a negotiation by sending an offer through `relay`. Returns
    /// `Ok(false)` when the connection is not `Dead` and nothing was sent.
    pub async fn create_offer(&self, relay: Option<&RelaySender>) -> Result<bool, NetworkError> {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Dead {
            trace!(owner = %self.owner, peer = %self.peer, state = %inner.state, "no need to create offer");
            return Ok(false);
        }
        let relay = relay.ok_or(NetworkError::SignalingUnavailable)?;

        inner.last_failure = None;
        self.set_state(&mut inner, ConnectionState::Offered);
        let offer = match self.offer_inner(&mut inner).await {
            Ok(offer) => offer,
            Err(err) => {
                error!(owner = %self.owner, peer = %self.peer, error = %err, "failed to create offer");
                self.kill_inner(&mut inner, Some(err.clone()));
                return Err(err);
            }
        };
        info!(owner = %self.owner, peer = %self.peer, "offer created");

        let message = SignalMessage::ConnectRequest(ConnectRequest {
            from_worker_id: self.owner.clone(),
            to_worker_id: self.peer.clone(),
            sdp: offer,
        });
        self.transmit(relay.clone(), inner.generation, message);
        Ok(true)
    }

    async fn offer_inner(&self, inner: &mut Inner) -> Result<SessionDescription, NetworkError> {
        let transport = self.init_inner(inner).await?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer).await?;
        transport
            .local_description()
            .await
            .ok_or_else(|| NetworkError::Transport("no local description after offer".into()))
    }

    /// Answers a remote offer. Returns `Ok(false)` when the offer lost the
    /// tie-break against our own pending offer.
    pub async fn create_answer(
        &self,
        offer: SessionDescription,
        relay: &RelaySender,
    ) -> Result<bool, NetworkError> {
        if offer.kind != SdpKind::Offer {
            warn!(owner = %self.owner, peer = %self.peer, kind = %offer.kind, "invalid sdp kind for creating answer");
            return Ok(false);
        }

        let mut inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::Connected => {
                // The peer lost the link and is rebuilding it.
                self.reset_inner(&mut inner, None);
                info!(owner = %self.owner, peer = %self.peer, "peer reconnecting, dropping old link");
            }
            ConnectionState::Offered if self.owner < self.peer => {
                info!(owner = %self.owner, peer = %self.peer, "simultaneous offers, staying the offerer");
                return Ok(false);
            }
            ConnectionState::Offered => {
                self.reset_inner(&mut inner, None);
                info!(owner = %self.owner, peer = %self.peer, "simultaneous offers, becoming the answerer");
            }
            ConnectionState::Waiting => {
                self.reset_inner(&mut inner, None);
                debug!(owner = %self.owner, peer = %self.peer, "new offer replaces pending negotiation");
            }
            ConnectionState::Dead => {}
        }

        inner.last_failure = None;
        self.set_state(&mut inner, ConnectionState::Waiting);
        let answer = match self.answer_inner(&mut inner, offer).await {
            Ok(answer) => answer,
            Err(err) => {
                error!(owner = %self.owner, peer = %self.peer, error = %err, "failed to create answer");
                self.kill_inner(&mut inner, Some(err.clone()));
                return Err(err);
            }
        };
        info!(owner = %self.owner, peer = %self.peer, "answer created");

        let message = SignalMessage::ConnectReply(ConnectReply::accept(
            self.owner.clone(),
            self.peer.clone(),
            answer,
        ));
        self.transmit(relay.clone(), inner.generation, message);
        Ok(true)
    }

    async fn answer_inner(
        &self,
        inner: &mut Inner,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NetworkError> {
        let transport = self.init_inner(inner).await?;
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer).await?;
        transport
            .local_description()
            .await
            .ok_or_else(|| NetworkError::Transport("no local description after answer".into()))
    }

    /// Applies the remote answer to our offer; `None` means the offer was
    /// refused and the connection returns to `Dead`.
    pub async fn set_answer(
        &self,
        answer: Option<SessionDescription>,
        refusal: Option<RefusalReason>,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnectionState::Offered {
            debug!(owner = %self.owner, peer = %self.peer, state = %inner.state, "ignoring answer outside of offered state");
            return;
        }
        let Some(answer) = answer else {
            let failure = match refusal {
                Some(RefusalReason::Unreachable) => NetworkError::PeerUnreachable {
                    peer: self.peer.clone(),
                },
                _ => NetworkError::NegotiationRefused {
                    peer: self.peer.clone(),
                },
            };
            warn!(owner = %self.owner, peer = %self.peer, reason = %failure, "offer refused");
            self.kill_inner(&mut inner, Some(failure));
            return;
        };
        if answer.kind != SdpKind::Answer {
            warn!(owner = %self.owner, peer = %self.peer, kind = %answer.kind, "invalid sdp kind for setting answer");
            return;
        }

        self.set_state(&mut inner, ConnectionState::Waiting);
        let Some(transport) = inner.transport.clone() else {
            error!(owner = %self.owner, peer = %self.peer, "offered connection has no transport");
            self.kill_inner(&mut inner, None);
            return;
        };
        if let Err(err) = transport.set_remote_description(answer).await {
            error!(owner = %self.owner, peer = %self.peer, error = %err, "failed to apply answer");
            self.kill_inner(&mut inner, Some(err));
        }
    }

    /// Queues relay traffic for this connection. Offers and replies are
    /// processed one at a time in the order they arrived.
    pub(crate) fn deliver_offer(&self, sdp: SessionDescription, relay: RelaySender) {
        let _ = self.inbox.send(Negotiation::Offer { sdp, relay });
    }

    pub(crate) fn deliver_reply(&self, reply: ConnectReply) {
        let _ = self.inbox.send(Negotiation::Reply(reply));
    }

    /// Tears the link down; the connection may be negotiated again later.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.transport.is_some() || inner.state != ConnectionState::Dead {
            self.kill_inner(&mut inner, None);
            info!(owner = %self.owner, peer = %self.peer, "connection closed");
        }
    }

    async fn init_inner(&self, inner: &mut Inner) -> Result<Arc<dyn RtcTransport>, NetworkError> {
        inner.generation += 1;
        let generation = inner.generation;
        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = self.provider.create(&self.ice_servers, events_tx).await?;
        inner.transport = Some(Arc::clone(&transport));
        tokio::spawn(pump_transport_events(self.this.clone(), generation, events));

        let channel = transport.create_data_channel(&self.owner).await?;
        inner.outward = Some(Arc::new(OutwardDataChannel::new(channel)));
        Ok(transport)
    }

    /// Drops channels and transport without announcing `Dead`; callers go on
    /// to another state while still holding the lock.
    fn reset_inner(&self, inner: &mut Inner, failure: Option<NetworkError>) {
        inner.state = ConnectionState::Dead;
        if failure.is_some() {
            inner.last_failure = failure;
        }
        if let Some(outward) = inner.outward.take() {
            outward.close();
        }
        if let Some(inward) = inner.inward.take() {
            inward.close();
        }
        if let Some(transport) = inner.transport.take() {
            let peer = self.peer.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.close().await {
                    debug!(peer = %peer, error = %err, "closing transport failed");
                }
            });
        }
    }

    fn kill_inner(&self, inner: &mut Inner, failure: Option<NetworkError>) {
        self.reset_inner(inner, failure);
        self.state.send_replace(ConnectionState::Dead);
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        inner.state = state;
        self.state.send_replace(state);
    }

    /// Sends a description through the relay in the background. A failed
    /// send kills the transport it belongs to.
    fn transmit(&self, relay: RelaySender, generation: u64, message: SignalMessage) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let kind = message.kind();
            match relay.send(message).await {
                Ok(()) => trace!(owner = %this.owner, peer = %this.peer, kind, "description sent"),
                Err(err) => {
                    error!(owner = %this.owner, peer = %this.peer, kind, error = %err, "failed to send description");
                    let mut inner = this.inner.lock().await;
                    if inner.generation == generation && inner.transport.is_some() {
                        this.kill_inner(&mut inner, Some(err));
                    }
                }
            }
        });
    }

    /// Returns false once `generation` is stale and its events can be dropped.
    async fn on_transport_event(&self, generation: u64, event: TransportEvent) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation || inner.transport.is_none() {
            trace!(owner = %self.owner, peer = %self.peer, ?event, "dropping event of stale transport");
            return false;
        }
        match event {
            TransportEvent::StateChange(LinkState::Connected) => {
                if inner.state != ConnectionState::Dead {
                    self.set_state(&mut inner, ConnectionState::Connected);
                    info!(owner = %self.owner, peer = %self.peer, "connection changes state to connected");
                }
            }
            TransportEvent::StateChange(state @ (LinkState::Failed | LinkState::Closed)) => {
                warn!(owner = %self.owner, peer = %self.peer, link = ?state, "connection changes state to dead");
                let failure = NetworkError::ConnectionDead {
                    peer: self.peer.clone(),
                };
                self.kill_inner(&mut inner, Some(failure));
                return false;
            }
            TransportEvent::StateChange(state) => {
                trace!(owner = %self.owner, peer = %self.peer, link = ?state, "link state changed");
            }
            TransportEvent::DataChannel(channel) => {
                info!(owner = %self.owner, peer = %self.peer, label = channel.label(), "inward data channel created");
                if let Some(previous) = inner.inward.take() {
                    previous.close();
                }
                inner.inward = Some(InwardDataChannel::spawn(channel, self.handlers.clone()));
            }
        }
        true
    }

    /// `Ok(None)` while a negotiation is in flight.
    async fn ready_outward(&self) -> Result<Option<Arc<OutwardDataChannel>>, NetworkError> {
        let inner = self.inner.lock().await;
        match inner.state {
            ConnectionState::Connected => match &inner.outward {
                Some(outward) => Ok(Some(Arc::clone(outward))),
                None => {
                    error!(owner = %self.owner, peer = %self.peer, "connected without an outward channel");
                    Err(self.dead_error())
                }
            },
            ConnectionState::Dead => Err(inner.last_failure.clone().unwrap_or_else(|| self.dead_error())),
            ConnectionState::Offered | ConnectionState::Waiting => Ok(None),
        }
    }

    fn dead_error(&self) -> NetworkError {
        NetworkError::ConnectionDead {
            peer: self.peer.clone(),
        }
    }
}

#[async_trait]
impl Connection for PeerConnection {
    async fn send(&self, op: &str, payload: Bytes) -> Result<Response, NetworkError> {
        let mut transitions = self.subscribe();
        let outward = match self.ready_outward().await? {
            Some(outward) => outward,
            None => {
                debug!(owner = %self.owner, peer = %self.peer, op, "waiting for negotiation");
                let _ = transitions
                    .wait_for(|state| {
                        matches!(state, ConnectionState::Connected | ConnectionState::Dead)
                    })
                    .await;
                self.ready_outward().await?.ok_or_else(|| self.dead_error())?
            }
        };
        trace!(owner = %self.owner, peer = %self.peer, op, "sending request");
        outward.send(op, payload).await
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("owner", &self.owner)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

async fn pump_transport_events(
    connection: Weak<PeerConnection>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if !connection.on_transport_event(generation, event).await {
            break;
        }
    }
}

async fn run_negotiations(
    connection: Weak<PeerConnection>,
    mut negotiations: mpsc::UnboundedReceiver<Negotiation>,
) {
    while let Some(negotiation) = negotiations.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        match negotiation {
            Negotiation::Offer { sdp, relay } => {
                if let Err(err) = connection.create_answer(sdp, &relay).await {
                    warn!(owner = %connection.owner, peer = %connection.peer, error = %err, "could not answer offer");
                }
            }
            Negotiation::Reply(reply) => {
                let refusal = reply.refusal_reason();
                connection.set_answer(reply.sdp, refusal).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerFault;
    use crate::signaling::Outgoing;
    use crate::transport::MemoryNetwork;

    fn handlers() -> HandlerRegistry {
        HandlerRegistry::builder()
            .sync_handler("ping", |_payload: Bytes| Ok::<_, HandlerFault>("pong"))
            .build()
    }

    fn connection(network: &MemoryNetwork, owner: &str, peer: &str) -> Arc<PeerConnection> {
        PeerConnection::new(
            owner.into(),
            peer.into(),
            Vec::new(),
            network.provider(),
            handlers(),
        )
    }

    async fn next_sent(outbox: &mut mpsc::UnboundedReceiver<Outgoing>) -> SignalMessage {
        let outgoing = outbox.recv().await.expect("relay frame");
        let message = outgoing.message.clone();
        outgoing.ack(Ok(()));
        message
    }

    async fn wait_state(connection: &PeerConnection, wanted: ConnectionState) {
        let mut states = connection.subscribe();
        states
            .wait_for(|state| *state == wanted)
            .await
            .expect("state sender alive");
    }

    /// Drives a full offer/answer exchange between `a` (offerer) and `b`.
    async fn establish(
        a: &Arc<PeerConnection>,
        b: &Arc<PeerConnection>,
    ) -> (
        mpsc::UnboundedReceiver<Outgoing>,
        mpsc::UnboundedReceiver<Outgoing>,
    ) {
        let (relay_a, mut outbox_a) = RelaySender::channel();
        let (relay_b, mut outbox_b) = RelaySender::channel();
        assert!(a.create_offer(Some(&relay_a)).await.expect("offer"));
        let SignalMessage::ConnectRequest(request) = next_sent(&mut outbox_a).await else {
            panic!("expected connect_request");
        };
        assert!(b.create_answer(request.sdp, &relay_b).await.expect("answer"));
        let SignalMessage::ConnectReply(reply) = next_sent(&mut outbox_b).await else {
            panic!("expected connect_reply");
        };
        a.set_answer(reply.sdp, None).await;
        wait_state(a, ConnectionState::Connected).await;
        wait_state(b, ConnectionState::Connected).await;
        (outbox_a, outbox_b)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offer_answer_reaches_connected() {
        let network = MemoryNetwork::new();
        let a = connection(&network, "a", "b");
        let b = connection(&network, "b", "a");
        let _outboxes = establish(&a, &b).await;

        let reply = a.send("ping", Bytes::new()).await.expect("ping");
        assert_eq!(reply.text(), Some("pong"));
        let reply = b.send("ping", Bytes::new()).await.expect("ping back");
        assert_eq!(reply.text(), Some("pong"));
        assert_eq!(network.open_links(), 1);

        let (relay, _outbox) = RelaySender::channel();
        assert!(!a.create_offer(Some(&relay)).await.expect("no-op"));
        assert_eq!(network.transports_created(), 2);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offer_without_relay_is_rejected() {
        let network = MemoryNetwork::new();
        let a = connection(&network, "a", "b");
        assert_eq!(
            a.create_offer(None).await,
            Err(NetworkError::SignalingUnavailable)
        );
        assert_eq!(a.state(), ConnectionState::Dead);
        assert_eq!(network.transports_created(), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn glare_keeps_smaller_id_as_offerer() {
        let network = MemoryNetwork::new();
        let (relay_small, mut outbox_small) = RelaySender::channel();
        let (relay_large, mut outbox_large) = RelaySender::channel();
        let small = connection(&network, "a", "b");
        let large = connection(&network, "b", "a");
        assert!(small.create_offer(Some(&relay_small)).await.expect("offer"));
        assert!(large.create_offer(Some(&relay_large)).await.expect("offer"));
        let SignalMessage::ConnectRequest(from_small) = next_sent(&mut outbox_small).await else {
            panic!("expected connect_request");
        };
        let SignalMessage::ConnectRequest(from_large) = next_sent(&mut outbox_large).await else {
            panic!("expected connect_request");
        };

        assert!(!small
            .create_answer(from_large.sdp, &relay_small)
            .await
            .expect("tie-break"));
        assert_eq!(small.state(), ConnectionState::Offered);

        assert!(large
            .create_answer(from_small.sdp, &relay_large)
            .await
            .expect("answer"));
        assert_eq!(large.state(), ConnectionState::Waiting);
        let SignalMessage::ConnectReply(reply) = next_sent(&mut outbox_large).await else {
            panic!("expected connect_reply");
        };
        small.set_answer(reply.sdp, reply.reason).await;

        wait_state(&small, ConnectionState::Connected).await;
        wait_state(&large, ConnectionState::Connected).await;
        assert_eq!(network.transports_created(), 3);
        assert_eq!(network.open_links(), 1);
        let reply = large.send("ping", Bytes::new()).await.expect("ping");
        assert_eq!(reply.text(), Some("pong"));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn refusal_resets_to_dead_with_reason() {
        let network = MemoryNetwork::new();
        let (relay, mut outbox) = RelaySender::channel();
        let a = connection(&network, "a", "ghost");
        assert!(a.create_offer(Some(&relay)).await.expect("offer"));
        let _ = next_sent(&mut outbox).await;

        let waiter = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.send("ping", Bytes::new()).await })
        };
        a.set_answer(None, Some(RefusalReason::Unreachable)).await;
        assert_eq!(a.state(), ConnectionState::Dead);
        assert_eq!(
            waiter.await.expect("join"),
            Err(NetworkError::PeerUnreachable {
                peer: "ghost".into()
            })
        );

        // A new negotiation clears the remembered reason.
        assert!(a.create_offer(Some(&relay)).await.expect("offer again"));
        a.set_answer(None, None).await;
        assert_eq!(
            a.send("ping", Bytes::new()).await,
            Err(NetworkError::NegotiationRefused {
                peer: "ghost".into()
            })
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failed_relay_send_kills_transport() {
        let network = MemoryNetwork::new();
        let (relay, mut outbox) = RelaySender::channel();
        let a = connection(&network, "a", "b");
        assert!(a.create_offer(Some(&relay)).await.expect("offer"));
        let outgoing = outbox.recv().await.expect("frame");
        outgoing.ack(Err(NetworkError::Signaling("socket closed".into())));
        wait_state(&a, ConnectionState::Dead).await;
        assert!(matches!(
            a.send("ping", Bytes::new()).await,
            Err(NetworkError::Signaling(_))
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn lost_link_resets_and_renegotiates() {
        let network = MemoryNetwork::new();
        let a = connection(&network, "a", "b");
        let b = connection(&network, "b", "a");
        let (_outbox_a, _outbox_b) = establish(&a, &b).await;

        network.sever_all();
        wait_state(&a, ConnectionState::Dead).await;
        wait_state(&b, ConnectionState::Dead).await;
        assert_eq!(
            a.send("ping", Bytes::new()).await,
            Err(NetworkError::ConnectionDead { peer: "b".into() })
        );

        let _outboxes = establish(&a, &b).await;
        let reply = a.send("ping", Bytes::new()).await.expect("ping");
        assert_eq!(reply.text(), Some("pong"));
        assert_eq!(network.transports_created(), 4);
        assert_eq!(network.open_links(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn offer_on_connected_link_rebuilds_it() {
        let network = MemoryNetwork::new();
        let a = connection(&network, "a", "b");
        let b = connection(&network, "b", "a");
        let _first = establish(&a, &b).await;

        // `b` never noticed anything; `a` starts over from a fresh object.
        let a_again = connection(&network, "a", "b");
        let _second = establish(&a_again, &b).await;
        let reply = a_again.send("ping", Bytes::new()).await.expect("ping");
        assert_eq!(reply.text(), Some("pong"));
        assert_eq!(network.open_links(), 1);
    }
}
