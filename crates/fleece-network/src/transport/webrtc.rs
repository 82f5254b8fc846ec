use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fleece_proto::{IceServerConfig, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    ChannelEvent, DataChannel, EventSlot, LinkState, RtcTransport, TransportEvent,
    TransportEvents, TransportProvider,
};
use crate::error::{to_transport_error, NetworkError};

/// Transport provider backed by the `webrtc` crate.
pub struct WebRtcProvider {
    api: API,
}

impl WebRtcProvider {
    pub fn new() -> Result<Self, NetworkError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(to_transport_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(to_transport_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl TransportProvider for WebRtcProvider {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: TransportEvents,
    ) -> Result<Arc<dyn RtcTransport>, NetworkError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_transport_error)?,
        );

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!(target = "webrtc", ?state, "peer connection state changed");
                if let Some(link) = link_state(state) {
                    let _ = events.send(TransportEvent::StateChange(link));
                }
            })
        }));

        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = events.clone();
            Box::pin(async move {
                debug!(target = "webrtc", label = dc.label(), "remote opened data channel");
                let channel: Arc<dyn DataChannel> = WebRtcDataChannel::wrap(dc);
                let _ = events.send(TransportEvent::DataChannel(channel));
            })
        }));

        Ok(Arc::new(WebRtcTransport { pc }))
    }
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl RtcTransport for WebRtcTransport {
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, NetworkError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(to_transport_error)?;
        Ok(WebRtcDataChannel::wrap(dc))
    }

    async fn create_offer(&self) -> Result<SessionDescription, NetworkError> {
        let offer = self.pc.create_offer(None).await.map_err(to_transport_error)?;
        from_rtc_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NetworkError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_transport_error)?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), NetworkError> {
        let description = to_rtc_description(sdp)?;
        // Candidates are not trickled: wait for gathering so the local
        // description carries all of them.
        let mut gather = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_transport_error)?;
        let _ = gather.recv().await;
        trace!(target = "webrtc", "ice gathering complete");
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), NetworkError> {
        let description = to_rtc_description(sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_transport_error)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc_description(&description).ok()
    }

    async fn close(&self) -> Result<(), NetworkError> {
        self.pc.close().await.map_err(to_transport_error)
    }
}

struct WebRtcDataChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
    events: EventSlot,
}

impl WebRtcDataChannel {
    fn wrap(dc: Arc<RTCDataChannel>) -> Arc<dyn DataChannel> {
        let events = EventSlot::new();
        let label = dc.label().to_string();

        let open_tx = events.sender();
        dc.on_open(Box::new(move || {
            let tx = open_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Open);
            })
        }));
        let message_tx = events.sender();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = message_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Message(msg.data));
            })
        }));
        let close_tx = events.sender();
        dc.on_close(Box::new(move || {
            let tx = close_tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Closed);
            })
        }));
        let error_label = label.clone();
        dc.on_error(Box::new(move |err| {
            let label = error_label.clone();
            Box::pin(async move {
                warn!(target = "webrtc", label = %label, error = %err, "data channel error");
            })
        }));

        // An inbound channel may already be open by the time it is handed over.
        if dc.ready_state() == RTCDataChannelState::Open {
            events.emit(ChannelEvent::Open);
        }

        Arc::new(Self { label, dc, events })
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<(), NetworkError> {
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(to_transport_error)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.take()
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(target = "webrtc", label = %self.label, error = %err, "closing data channel failed");
        }
    }
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn to_rtc_ice_server(server: &IceServerConfig) -> RTCIceServer {
    RTCIceServer {
        urls: vec![server.url.clone()],
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(sdp: SessionDescription) -> Result<RTCSessionDescription, NetworkError> {
    match sdp.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp),
    }
    .map_err(to_transport_error)
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription, NetworkError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp.clone())),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp.clone())),
        other => Err(NetworkError::Transport(format!(
            "unsupported sdp type {other}"
        ))),
    }
}
