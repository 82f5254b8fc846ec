//! Worker id → live relay session table.

use std::sync::Arc;

use dashmap::DashMap;
use fleece_proto::{CodecError, ConnectReply, SignalMessage, WorkerId};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound text frames of one websocket session.
pub type SessionSender = mpsc::UnboundedSender<String>;

#[derive(Clone)]
struct Session {
    id: Uuid,
    tx: SessionSender,
}

#[derive(Clone, Default)]
pub struct RelayRegistry {
    sessions: Arc<DashMap<WorkerId, Session>>,
}

/// What became of a frame handed to [`RelayRegistry::relay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { to: WorkerId },
    /// Nobody is registered under the offer's destination; the reply goes
    /// back to the sender.
    Refused(SignalMessage),
    /// A reply for a worker that is not registered.
    Dropped { to: WorkerId },
    /// Registration frames are not routable once a session is open.
    Unroutable { kind: &'static str },
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session for `worker_id`, replacing any previous one.
    pub fn register(&self, worker_id: &str, tx: SessionSender) -> Uuid {
        let id = Uuid::new_v4();
        let replaced = self
            .sessions
            .insert(worker_id.to_string(), Session { id, tx })
            .is_some();
        counter!("fleece_road_registrations_total", 1);
        info!(worker_id, session_id = %id, replaced, "worker registered");
        id
    }

    /// Drops the registration only while `session_id` still owns it, so a
    /// closing stale socket cannot evict a newer session.
    pub fn unregister(&self, worker_id: &str, session_id: Uuid) -> bool {
        let removed = self
            .sessions
            .remove_if(worker_id, |_, session| session.id == session_id)
            .is_some();
        if removed {
            info!(worker_id, session_id = %session_id, "worker unregistered");
        }
        removed
    }

    pub fn is_registered(&self, worker_id: &str) -> bool {
        self.sessions.contains_key(worker_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Forwards `text` verbatim to the session named by its destination.
    pub fn relay(&self, text: &str) -> Result<RelayOutcome, CodecError> {
        let message = SignalMessage::from_text(text)?;
        let Some(to) = message.destination() else {
            return Ok(RelayOutcome::Unroutable {
                kind: message.kind(),
            });
        };
        let target = self.sessions.get(to).map(|entry| entry.tx.clone());

        if let Some(tx) = target {
            if tx.send(text.to_string()).is_ok() {
                counter!("fleece_road_messages_relayed_total", 1, "kind" => message.kind());
                debug!(to, kind = message.kind(), "frame relayed");
                return Ok(RelayOutcome::Delivered { to: to.to_string() });
            }
            warn!(to, "session writer is gone");
        }

        match &message {
            SignalMessage::ConnectRequest(request) => {
                counter!("fleece_road_refusals_total", 1);
                info!(
                    from = %request.from_worker_id,
                    to = %request.to_worker_id,
                    "offer for unregistered worker refused"
                );
                Ok(RelayOutcome::Refused(SignalMessage::ConnectReply(
                    ConnectReply::unreachable(request),
                )))
            }
            _ => {
                warn!(to, kind = message.kind(), "dropping frame for unregistered worker");
                Ok(RelayOutcome::Dropped { to: to.to_string() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fleece_proto::{ConnectRequest, RefusalReason, SessionDescription};

    use super::*;

    fn offer(from: &str, to: &str) -> String {
        SignalMessage::ConnectRequest(ConnectRequest {
            from_worker_id: from.into(),
            to_worker_id: to.into(),
            sdp: SessionDescription::offer("v=0"),
        })
        .to_text()
        .expect("encode")
    }

    #[test]
    fn last_registration_wins() {
        let registry = RelayRegistry::new();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        let old = registry.register("b", old_tx);
        let _new = registry.register("b", new_tx);
        assert_eq!(registry.len(), 1);

        // The stale socket closing must not evict the newer session.
        assert!(!registry.unregister("b", old));
        assert!(registry.is_registered("b"));

        let text = offer("a", "b");
        assert_eq!(
            registry.relay(&text).expect("relay"),
            RelayOutcome::Delivered { to: "b".into() }
        );
        assert_eq!(new_rx.try_recv().expect("forwarded"), text);
        assert!(old_rx.try_recv().is_err());
    }

    #[test]
    fn offer_to_unknown_worker_is_refused() {
        let registry = RelayRegistry::new();
        let outcome = registry.relay(&offer("a", "ghost")).expect("relay");
        let RelayOutcome::Refused(SignalMessage::ConnectReply(reply)) = outcome else {
            panic!("expected a refusal, got {outcome:?}");
        };
        assert_eq!(reply.from_worker_id, "ghost");
        assert_eq!(reply.to_worker_id, "a");
        assert_eq!(reply.refusal_reason(), Some(RefusalReason::Unreachable));
    }

    #[test]
    fn reply_to_unknown_worker_is_dropped() {
        let registry = RelayRegistry::new();
        let text = SignalMessage::ConnectReply(ConnectReply::accept(
            "b".into(),
            "a".into(),
            SessionDescription::answer("v=0"),
        ))
        .to_text()
        .expect("encode");
        assert_eq!(
            registry.relay(&text).expect("relay"),
            RelayOutcome::Dropped { to: "a".into() }
        );
    }

    #[test]
    fn registration_frames_are_not_routed() {
        let registry = RelayRegistry::new();
        let text = SignalMessage::RegisterRequest {
            worker_id: "a".into(),
        }
        .to_text()
        .expect("encode");
        assert_eq!(
            registry.relay(&text).expect("relay"),
            RelayOutcome::Unroutable {
                kind: "register_request"
            }
        );
        assert!(registry.relay("{not json").is_err());
    }
}
