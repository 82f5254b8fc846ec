//! Worker side of the relay session.

use std::sync::Weak;
use std::time::Duration;

use fleece_proto::{SignalMessage, WorkerId, REGISTER_OK};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::{to_signaling_error, NetworkError};

/// Receives what arrives over the relay session.
pub(crate) trait SignalSink: Send + Sync {
    /// Called with the new session once registered, and with `None` when it
    /// is gone.
    fn session_changed(&self, relay: Option<RelaySender>);

    fn dispatch(&self, message: SignalMessage, relay: &RelaySender);
}

/// A frame waiting to be written, with the writer's verdict.
pub(crate) struct Outgoing {
    pub(crate) message: SignalMessage,
    ack: oneshot::Sender<Result<(), NetworkError>>,
}

impl Outgoing {
    pub(crate) fn ack(self, result: Result<(), NetworkError>) {
        let _ = self.ack.send(result);
    }
}

/// Handle to one registered relay session.
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl RelaySender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Resolves once the frame was written to the socket.
    pub async fn send(&self, message: SignalMessage) -> Result<(), NetworkError> {
        let (ack, written) = oneshot::channel();
        self.tx
            .send(Outgoing { message, ack })
            .map_err(|_| NetworkError::SignalingUnavailable)?;
        written.await.unwrap_or(Err(NetworkError::SignalingUnavailable))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for RelaySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySender")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Closed,
    Rejected(String),
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Keeps the worker registered: dials the relay, registers, dispatches
/// inbound frames, and re-dials after `backoff` whenever the session ends.
/// Stops for good when the relay rejects the registration or the sink is
/// dropped.
pub(crate) async fn register_loop(
    url: Url,
    worker_id: WorkerId,
    backoff: Duration,
    sink: Weak<dyn SignalSink>,
) {
    loop {
        match run_session(&url, &worker_id, &sink).await {
            Ok(SessionEnd::Rejected(status)) => {
                error!(worker_id = %worker_id, status = %status, "relay rejected registration");
                if let Some(sink) = sink.upgrade() {
                    sink.session_changed(None);
                }
                return;
            }
            Ok(SessionEnd::Closed) => {
                info!(worker_id = %worker_id, "relay session closed");
            }
            Err(err) => {
                warn!(worker_id = %worker_id, url = %url, error = %err, "failed to connect to signaling server");
            }
        }
        match sink.upgrade() {
            Some(sink) => sink.session_changed(None),
            None => return,
        }
        tokio::time::sleep(backoff).await;
    }
}

async fn run_session(
    url: &Url,
    worker_id: &str,
    sink: &Weak<dyn SignalSink>,
) -> Result<SessionEnd, NetworkError> {
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(to_signaling_error)?;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let hello = SignalMessage::RegisterRequest {
        worker_id: worker_id.to_string(),
    }
    .to_text()?;
    ws_write
        .send(Message::Text(hello))
        .await
        .map_err(to_signaling_error)?;
    info!(worker_id, "registering worker");

    let reply = loop {
        match ws_read.next().await {
            Some(Ok(Message::Text(text))) => break SignalMessage::from_text(&text)?,
            Some(Ok(Message::Binary(data))) => break SignalMessage::from_slice(&data)?,
            Some(Ok(Message::Close(_))) | None => {
                return Err(NetworkError::Signaling(
                    "relay closed the session during registration".into(),
                ))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(to_signaling_error(err)),
        }
    };
    match reply {
        SignalMessage::RegisterReply { status } if status == REGISTER_OK => {}
        SignalMessage::RegisterReply { status } => return Ok(SessionEnd::Rejected(status)),
        other => {
            return Err(NetworkError::Signaling(format!(
                "unexpected {} during registration",
                other.kind()
            )))
        }
    }

    let (relay, mut outbox) = RelaySender::channel();
    let _writer = AbortOnDrop(tokio::spawn(async move {
        while let Some(outgoing) = outbox.recv().await {
            let result = match outgoing.message.to_text() {
                Ok(text) => ws_write
                    .send(Message::Text(text))
                    .await
                    .map_err(to_signaling_error),
                Err(err) => {
                    outgoing.ack(Err(err.into()));
                    continue;
                }
            };
            let failed = result.is_err();
            outgoing.ack(result);
            if failed {
                break;
            }
        }
    }));

    match sink.upgrade() {
        Some(sink) => sink.session_changed(Some(relay.clone())),
        None => return Ok(SessionEnd::Closed),
    }
    info!(worker_id, "connected to signaling server");

    while let Some(frame) = ws_read.next().await {
        let decoded = match frame {
            Ok(Message::Text(text)) => SignalMessage::from_text(&text),
            Ok(Message::Binary(data)) => SignalMessage::from_slice(&data),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => return Err(to_signaling_error(err)),
        };
        let message = match decoded {
            Ok(message) => message,
            Err(err) => {
                warn!(worker_id, error = %err, "dropping undecodable relay frame");
                continue;
            }
        };
        debug!(worker_id, kind = message.kind(), "relay frame received");
        match sink.upgrade() {
            Some(sink) => sink.dispatch(message, &relay),
            None => break,
        }
    }
    Ok(SessionEnd::Closed)
}
