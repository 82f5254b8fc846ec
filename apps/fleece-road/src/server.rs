use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use fleece_proto::{SignalMessage, WorkerId, REGISTER_OK};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::RoadConfig;
use crate::registry::{RelayOutcome, RelayRegistry};

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub struct AppState {
    registry: RelayRegistry,
    handshake_timeout: Duration,
    metrics: Option<PrometheusHandle>,
    closing: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: &RoadConfig, metrics: Option<PrometheusHandle>) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            registry: RelayRegistry::new(),
            handshake_timeout: config.handshake_timeout,
            metrics,
            closing,
        }
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }

    /// Ends every open worker session. Upgraded websockets are not tracked
    /// by the HTTP server, so its graceful shutdown alone leaves them open.
    pub fn close_sessions(&self) {
        self.closing.send_replace(true);
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/register", get(ws_handler))
        .with_state(state)
}

/// Serves the relay on `listener` until `shutdown` resolves, then closes
/// the worker sessions so they re-register elsewhere.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let closing = Arc::clone(&state);
    let signal = async move {
        shutdown.await;
        info!(workers = closing.registry.len(), "closing worker sessions");
        closing.close_sessions();
    };
    axum::serve(listener, router(state))
        .with_graceful_shutdown(signal)
        .await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "workers": state.registry.len() }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    TimedOut,
    #[error("socket closed during handshake: {0:?}")]
    Closed(Option<String>),
    #[error("client sent invalid payload: {0}")]
    InvalidPayload(String),
    #[error("expected register_request, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("client closed socket before handshake")]
    SocketClosed,
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let worker_id = match perform_handshake(state.handshake_timeout, &mut ws_rx).await {
        Ok(worker_id) => worker_id,
        Err(err) => {
            counter!("fleece_road_handshake_failures_total", 1);
            warn!(error = %err, "registration handshake failed");
            let _ = ws_tx.close().await;
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session_id = state.registry.register(&worker_id, tx.clone());
    if let Err(err) = send_register_reply(&mut ws_tx).await {
        warn!(worker_id = %worker_id, error = %err, "failed to acknowledge registration");
        state.registry.unregister(&worker_id, session_id);
        return;
    }

    let writer_worker = worker_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        info!(worker_id = %writer_worker, "writer task finished");
    });

    let mut closing = state.closing.subscribe();
    loop {
        let message = tokio::select! {
            message = ws_rx.next() => match message {
                Some(message) => message,
                None => break,
            },
            _ = async { let _ = closing.wait_for(|closing| *closing).await; } => {
                info!(worker_id = %worker_id, "relay shutting down, closing session");
                break;
            }
        };
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(worker_id = %worker_id, "dropping non-utf8 frame");
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                info!(
                    worker_id = %worker_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "worker closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(worker_id = %worker_id, error = %err, "error receiving message");
                break;
            }
        };
        match state.registry.relay(&text) {
            Ok(RelayOutcome::Refused(reply)) => match reply.to_text() {
                Ok(reply) => {
                    let _ = tx.send(reply);
                }
                Err(err) => warn!(worker_id = %worker_id, error = %err, "failed to encode refusal"),
            },
            Ok(RelayOutcome::Unroutable { kind }) => {
                warn!(worker_id = %worker_id, kind, "ignoring unroutable frame");
            }
            Ok(_) => {}
            Err(err) => warn!(worker_id = %worker_id, error = %err, "dropping undecodable frame"),
        }
    }

    state.registry.unregister(&worker_id, session_id);
    // The writer drains and sends a close frame once the last sender is gone.
    drop(tx);
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(worker_id = %worker_id, session_id = %session_id, "relay session closed");
}

async fn perform_handshake(
    handshake_timeout: Duration,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<WorkerId, HandshakeError> {
    let hello = timeout(handshake_timeout, ws_rx.next())
        .await
        .map_err(|_| HandshakeError::TimedOut)?
        .ok_or(HandshakeError::SocketClosed)?
        .map_err(|err| HandshakeError::Protocol(err.to_string()))?;

    let message = match hello {
        Message::Text(text) => SignalMessage::from_text(&text),
        Message::Binary(bytes) => SignalMessage::from_slice(&bytes),
        Message::Close(frame) => {
            return Err(HandshakeError::Closed(frame.map(|f| f.reason.to_string())));
        }
        _ => return Err(HandshakeError::UnexpectedMessage("control frame")),
    }
    .map_err(|err| HandshakeError::InvalidPayload(err.to_string()))?;

    match message {
        SignalMessage::RegisterRequest { worker_id } => Ok(worker_id),
        other => Err(HandshakeError::UnexpectedMessage(other.kind())),
    }
}

async fn send_register_reply(
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> Result<(), HandshakeError> {
    let reply = SignalMessage::RegisterReply {
        status: REGISTER_OK.to_string(),
    }
    .to_text()
    .map_err(|err| HandshakeError::Protocol(err.to_string()))?;
    ws_tx
        .send(Message::Text(reply))
        .await
        .map_err(|err| HandshakeError::Protocol(err.to_string()))
}
