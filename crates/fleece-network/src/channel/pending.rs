use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use fleece_proto::Response;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::NetworkError;

pub(crate) type ReplySlot = oneshot::Receiver<Result<Response, NetworkError>>;

/// Outstanding requests of one outward channel, keyed by request id.
#[derive(Default)]
pub(crate) struct PendingReplies {
    next_id: AtomicU64,
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    waiting: HashMap<u64, oneshot::Sender<Result<Response, NetworkError>>>,
    closed: bool,
}

impl PendingReplies {
    /// Allocates the next request id. `None` once the table was failed.
    pub(crate) fn register(&self) -> Option<(u64, ReplySlot)> {
        let mut slots = self.slots.lock();
        if slots.closed {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        slots.waiting.insert(id, tx);
        Some((id, rx))
    }

    /// Hands `response` to the waiter of `id`. Returns false for ids that are
    /// not (or no longer) outstanding.
    pub(crate) fn resolve(&self, id: u64, response: Response) -> bool {
        let waiter = self.slots.lock().waiting.remove(&id);
        match waiter {
            Some(tx) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn cancel(&self, id: u64) {
        self.slots.lock().waiting.remove(&id);
    }

    /// Resolves every waiter with `ConnectionLost` and refuses new requests.
    /// Returns how many waiters were failed.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock();
            slots.closed = true;
            slots.waiting.drain().collect()
        };
        let count = drained.len();
        for (id, tx) in drained {
            let _ = tx.send(Err(NetworkError::ConnectionLost { id }));
        }
        count
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.slots.lock().closed
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().waiting.len()
    }
}

/// Waits on a slot returned by [`PendingReplies::register`].
pub(crate) async fn wait_reply(id: u64, slot: ReplySlot) -> Result<Response, NetworkError> {
    slot.await
        .unwrap_or(Err(NetworkError::ConnectionLost { id }))
}
