use std::sync::{Arc, Weak};

use dashmap::DashMap;
use fleece_proto::{SignalMessage, WorkerId};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::{Connection, Outward, SelfConnection};
use crate::config::PeerConfig;
use crate::connection::{ConnectionState, PeerConnection};
use crate::error::NetworkError;
use crate::handler::HandlerRegistry;
use crate::signaling::{register_loop, RelaySender, SignalSink};
use crate::transport::{TransportProvider, WebRtcProvider};

/// A worker's entry point to the network: owns the relay session, one
/// [`PeerConnection`] per remote worker and the handlers served to them.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    config: PeerConfig,
    handlers: HandlerRegistry,
    provider: Arc<dyn TransportProvider>,
    connections: DashMap<WorkerId, Arc<PeerConnection>>,
    relay: RwLock<Option<RelaySender>>,
    registered: watch::Sender<bool>,
    loopback: Arc<SelfConnection>,
    registration: Mutex<Option<JoinHandle<()>>>,
}

impl Peer {
    /// Creates the peer and starts registering with the relay in the
    /// background. Must be called within a tokio runtime.
    pub fn new(
        config: PeerConfig,
        handlers: HandlerRegistry,
        provider: Arc<dyn TransportProvider>,
    ) -> Self {
        let (registered, _) = watch::channel(false);
        let loopback = Arc::new(SelfConnection::new(
            config.worker_id.clone(),
            handlers.clone(),
        ));
        let inner = Arc::new(PeerInner {
            config,
            handlers,
            provider,
            connections: DashMap::new(),
            relay: RwLock::new(None),
            registered,
            loopback,
            registration: Mutex::new(None),
        });

        match inner.config.register_url() {
            Ok(url) => {
                let weak: Weak<PeerInner> = Arc::downgrade(&inner);
                let sink: Weak<dyn SignalSink> = weak;
                let handle = tokio::spawn(register_loop(
                    url,
                    inner.config.worker_id.clone(),
                    inner.config.reconnect_backoff,
                    sink,
                ));
                *inner.registration.lock() = Some(handle);
            }
            Err(err) => {
                warn!(worker_id = %inner.config.worker_id, error = %err, "not registering with relay");
            }
        }

        Self { inner }
    }

    /// Same as [`Peer::new`] with the WebRTC transport.
    pub fn with_webrtc(config: PeerConfig, handlers: HandlerRegistry) -> Result<Self, NetworkError> {
        let provider = Arc::new(WebRtcProvider::new()?);
        Ok(Self::new(config, handlers, provider))
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    /// Whether a relay session is currently registered.
    pub fn registered(&self) -> watch::Receiver<bool> {
        self.inner.registered.subscribe()
    }

    /// Resolves once a relay session is registered.
    pub async fn wait_registered(&self) {
        let mut registered = self.registered();
        let _ = registered.wait_for(|registered| *registered).await;
    }

    /// Returns a connection to `target`, starting a negotiation when the
    /// link is dead. Calls to the worker itself use the in-process loopback.
    ///
    /// The returned connection may still be negotiating; `send` waits for it.
    pub async fn connect(&self, target: &str) -> Result<Arc<dyn Connection>, NetworkError> {
        if target == self.worker_id() {
            return Ok(self.inner.loopback.clone());
        }
        let connection = self.inner.connection_for(target);
        let relay = self.inner.relay.read().clone();
        if connection.create_offer(relay.as_ref()).await? {
            info!(worker_id = %self.worker_id(), peer = target, "negotiation started");
        }
        Ok(connection)
    }

    pub fn connection(&self, target: &str) -> Option<Arc<PeerConnection>> {
        self.inner
            .connections
            .get(target)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn connected_peers(&self) -> Vec<WorkerId> {
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Connected)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Stops the registration loop and tears down every connection.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.registration.lock().take() {
            handle.abort();
        }
        self.inner.session_changed(None);
        let connections: Vec<_> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for connection in connections {
            connection.close().await;
        }
        self.inner.loopback.outward().close();
        info!(worker_id = %self.worker_id(), "peer shut down");
    }
}

impl PeerInner {
    fn connection_for(&self, target: &str) -> Arc<PeerConnection> {
        let entry = self
            .connections
            .entry(target.to_string())
            .or_insert_with(|| {
                PeerConnection::new(
                    self.config.worker_id.clone(),
                    target.to_string(),
                    self.config.ice_servers.clone(),
                    Arc::clone(&self.provider),
                    self.handlers.clone(),
                )
            });
        Arc::clone(entry.value())
    }
}

impl SignalSink for PeerInner {
    fn session_changed(&self, relay: Option<RelaySender>) {
        let registered = relay.is_some();
        *self.relay.write() = relay;
        self.registered.send_replace(registered);
    }

    fn dispatch(&self, message: SignalMessage, relay: &RelaySender) {
        let worker_id = &self.config.worker_id;
        match message {
            SignalMessage::ConnectRequest(request) => {
                if &request.to_worker_id != worker_id || &request.from_worker_id == worker_id {
                    warn!(
                        worker_id = %worker_id,
                        from = %request.from_worker_id,
                        to = %request.to_worker_id,
                        "dropping misrouted offer"
                    );
                    return;
                }
                info!(worker_id = %worker_id, peer = %request.from_worker_id, "received offer");
                self.connection_for(&request.from_worker_id)
                    .deliver_offer(request.sdp, relay.clone());
            }
            SignalMessage::ConnectReply(reply) => {
                let connection = self
                    .connections
                    .get(&reply.from_worker_id)
                    .map(|entry| Arc::clone(entry.value()));
                match connection {
                    Some(connection) => connection.deliver_reply(reply),
                    None => warn!(
                        worker_id = %worker_id,
                        peer = %reply.from_worker_id,
                        "dropping answer for unknown connection"
                    ),
                }
            }
            other => warn!(worker_id = %worker_id, kind = other.kind(), "unexpected relay message"),
        }
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.registration.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("worker_id", &self.worker_id())
            .field("connections", &self.inner.connections.len())
            .field("registered", &*self.inner.registered.borrow())
            .finish()
    }
}
