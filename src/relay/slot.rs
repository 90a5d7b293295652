use super::{
    handle::{ByteStream, NoticeWriter, SenderMeta},
    registry::Registry,
};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};
use tokio::sync::oneshot;

/// Where a slot is in its lifecycle.
///
/// A slot is created on the first admitted request for its path and torn out
/// of the registry as soon as it reaches `Done`, so `Done` is only ever
/// observed by a request that raced the teardown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Empty,
    SenderWaiting,
    ReceiversWaiting,
    Transferring,
    Done,
}

/// A sender parked in a slot: request metadata, the unread body, and the
/// writer for its streamed progress lines.
pub(crate) struct SenderEntry {
    pub meta: SenderMeta,
    pub body: ByteStream,
    pub notice: NoticeWriter,
}

/// A receiver parked in a slot. `id` stamps arrival order so classification
/// and cancellation are deterministic.
pub(crate) struct ReceiverEntry {
    id: u64,
    respond: oneshot::Sender<Response>,
}

impl ReceiverEntry {
    /// Delivers the committed response to the waiting receiver handler. The
    /// handler may have hung up in the meantime; that receiver is simply
    /// skipped.
    pub fn commit(self, response: Response) -> Result<(), ()> {
        self.respond.send(response).map_err(drop)
    }

    fn reject(self, path: &str) {
        let _ = self.respond.send(too_many_receivers(path));
    }
}

/// Everything the transfer pump needs, moved out of the slot in one piece
/// when the rendezvous completes.
pub(crate) struct Launch {
    pub sender: SenderEntry,
    pub receivers: Vec<ReceiverEntry>,
}

pub(crate) enum SenderRegister {
    /// Sender admitted. Carries the transfer handoff when the rendezvous is
    /// already complete.
    Admitted(Option<Launch>),
    /// The slot already has a sender.
    Conflict,
    /// The slot terminated between lookup and registration; the caller gets
    /// the entry back and retries against a fresh slot.
    Retry(SenderEntry),
}

pub(crate) enum ReceiverRegister {
    /// Receiver queued; the response arrives on the returned channel.
    Pending(u64, oneshot::Receiver<Response>, Option<Launch>),
    /// Receiver is over capacity.
    Rejected,
    /// The slot terminated between lookup and registration.
    Retry,
}

struct Inner {
    phase: Phase,
    /// Known once a sender has arrived; receivers queue unbounded before
    /// that.
    capacity: Option<NonZeroUsize>,
    sender: Option<SenderEntry>,
    receivers: Vec<ReceiverEntry>,
    next_receiver_id: u64,
}

/// Per-path rendezvous point: one sender meets N receivers, in any arrival
/// order, exactly once.
pub(crate) struct Slot {
    path: String,
    inner: Mutex<Inner>,
}

impl Slot {
    pub fn new(path: String) -> Self {
        Self {
            path,
            inner: Mutex::new(Inner {
                phase: Phase::Empty,
                capacity: None,
                sender: None,
                receivers: Vec::new(),
                next_receiver_id: 0,
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Registers a sender. The capacity it carries becomes the slot's
    /// capacity; any receivers already queued are classified against it
    /// immediately.
    pub fn register_sender(&self, entry: SenderEntry) -> SenderRegister {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            Phase::Done => SenderRegister::Retry(entry),
            Phase::SenderWaiting | Phase::Transferring => SenderRegister::Conflict,
            Phase::Empty => {
                let n = entry.meta.capacity;
                entry.notice.notify(&format!("Waiting for {n} receiver(s)..."));
                inner.capacity = Some(n);
                inner.sender = Some(entry);
                inner.phase = Phase::SenderWaiting;
                SenderRegister::Admitted(None)
            }
            Phase::ReceiversWaiting => {
                let n = entry.meta.capacity;
                entry.notice.notify(&format!("Waiting for {n} receiver(s)..."));
                inner.capacity = Some(n);
                // Queued receivers beyond the capacity revealed by the sender
                // are rejected in arrival order.
                if inner.receivers.len() > n.get() {
                    let late = inner.receivers.split_off(n.get());
                    tracing::debug!(path = %self.path, count = late.len(), "rejecting over-capacity receivers");
                    for receiver in late {
                        receiver.reject(&self.path);
                    }
                }
                if inner.receivers.len() == n.get() {
                    inner.phase = Phase::Transferring;
                    SenderRegister::Admitted(Some(Launch {
                        sender: entry,
                        receivers: std::mem::take(&mut inner.receivers),
                    }))
                } else {
                    inner.sender = Some(entry);
                    inner.phase = Phase::SenderWaiting;
                    SenderRegister::Admitted(None)
                }
            }
        }
    }

    /// Registers a receiver.
    ///
    /// ## Panics
    /// If internal bookkeeping desynchronises (a waiting sender without a
    /// recorded capacity).
    pub fn register_receiver(&self) -> ReceiverRegister {
        let mut inner = self.inner.lock().unwrap();
        match inner.phase {
            Phase::Done => ReceiverRegister::Retry,
            // The admitted set is full for the whole transfer; one more
            // receiver is one too many.
            Phase::Transferring => ReceiverRegister::Rejected,
            Phase::Empty | Phase::ReceiversWaiting => {
                let (id, rx) = inner.push_receiver();
                inner.phase = Phase::ReceiversWaiting;
                ReceiverRegister::Pending(id, rx, None)
            }
            Phase::SenderWaiting => {
                let n = inner
                    .capacity
                    .expect("waiting sender must have a capacity")
                    .get();
                if inner.receivers.len() >= n {
                    return ReceiverRegister::Rejected;
                }
                let (id, rx) = inner.push_receiver();
                if inner.receivers.len() == n {
                    inner.phase = Phase::Transferring;
                    let launch = Launch {
                        sender: inner.sender.take().expect("waiting sender must be present"),
                        receivers: std::mem::take(&mut inner.receivers),
                    };
                    ReceiverRegister::Pending(id, rx, Some(launch))
                } else {
                    ReceiverRegister::Pending(id, rx, None)
                }
            }
        }
    }

    /// Unregisters a pending receiver whose client went away. No-op once the
    /// transfer owns the receiver set.
    pub fn cancel_receiver(self: &Arc<Self>, id: u64, registry: &Registry) {
        let dispose = {
            let mut inner = self.inner.lock().unwrap();
            match inner.phase {
                Phase::Transferring | Phase::Done => false,
                _ => {
                    inner.receivers.retain(|r| r.id != id);
                    if inner.receivers.is_empty() && inner.sender.is_none() {
                        inner.phase = Phase::Done;
                        true
                    } else {
                        false
                    }
                }
            }
        };
        if dispose {
            tracing::debug!(path = %self.path, "last pending request gone, disposing slot");
            registry.remove(self);
        }
    }

    /// Unregisters a waiting sender whose client went away. Queued receivers
    /// stay and wait for the next sender, which reveals a fresh capacity.
    pub fn cancel_sender(self: &Arc<Self>, registry: &Registry) {
        let dispose = {
            let mut inner = self.inner.lock().unwrap();
            if inner.phase != Phase::SenderWaiting {
                return;
            }
            inner.sender = None;
            inner.capacity = None;
            if inner.receivers.is_empty() {
                inner.phase = Phase::Done;
                true
            } else {
                inner.phase = Phase::ReceiversWaiting;
                false
            }
        };
        if dispose {
            tracing::debug!(path = %self.path, "waiting sender gone, disposing slot");
            registry.remove(self);
        }
    }

    /// Marks the transfer complete and removes the slot from the registry,
    /// making the path reusable.
    pub fn finish(self: &Arc<Self>, registry: &Registry) {
        self.inner.lock().unwrap().phase = Phase::Done;
        registry.remove(self);
    }
}

impl Inner {
    fn push_receiver(&mut self) -> (u64, oneshot::Receiver<Response>) {
        let id = self.next_receiver_id;
        self.next_receiver_id += 1;
        let (tx, rx) = oneshot::channel();
        self.receivers.push(ReceiverEntry { id, respond: tx });
        (id, rx)
    }
}

pub(crate) fn too_many_receivers(path: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!("[ERROR] The number of receivers on {path:?} has reached its limit.\n"),
    )
        .into_response()
}

/// Unregisters a pending receiver when its handler future is dropped.
pub(crate) struct ReceiverGuard {
    registry: Arc<Registry>,
    slot: Arc<Slot>,
    id: u64,
}

impl ReceiverGuard {
    pub fn new(registry: Arc<Registry>, slot: Arc<Slot>, id: u64) -> Self {
        Self { registry, slot, id }
    }
}

impl Drop for ReceiverGuard {
    fn drop(&mut self) {
        self.slot.cancel_receiver(self.id, &self.registry);
    }
}

/// Unregisters a waiting sender when its response body is dropped.
pub(crate) struct SenderGuard {
    registry: Arc<Registry>,
    slot: Arc<Slot>,
}

impl SenderGuard {
    pub fn new(registry: Arc<Registry>, slot: Arc<Slot>) -> Self {
        Self { registry, slot }
    }
}

impl Drop for SenderGuard {
    fn drop(&mut self) {
        self.slot.cancel_sender(&self.registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::handle::{ByteStream, NoticeWriter};
    use bytes::Bytes;

    fn sender_entry(n: usize) -> SenderEntry {
        let (notice, _rx) = NoticeWriter::channel();
        SenderEntry {
            meta: SenderMeta {
                capacity: NonZeroUsize::new(n).unwrap(),
                content_length: None,
                content_type: None,
            },
            body: ByteStream::from_iter([Bytes::from_static(b"payload")]),
            notice,
        }
    }

    #[test]
    fn sender_then_receiver_launches_at_capacity() {
        let slot = Slot::new("/data".into());
        assert!(matches!(
            slot.register_sender(sender_entry(2)),
            SenderRegister::Admitted(None)
        ));
        let ReceiverRegister::Pending(_, _rx1, launch) = slot.register_receiver() else {
            panic!("first receiver must be admitted");
        };
        assert!(launch.is_none());
        let ReceiverRegister::Pending(_, _rx2, launch) = slot.register_receiver() else {
            panic!("second receiver must be admitted");
        };
        let launch = launch.expect("second receiver completes the rendezvous");
        assert_eq!(launch.receivers.len(), 2);
    }

    #[test]
    fn receiver_over_capacity_is_rejected() {
        let slot = Slot::new("/data".into());
        assert!(matches!(
            slot.register_sender(sender_entry(1)),
            SenderRegister::Admitted(None)
        ));
        let ReceiverRegister::Pending(_, _rx, launch) = slot.register_receiver() else {
            panic!("receiver within capacity must be admitted");
        };
        assert!(launch.is_some());
        // The slot is transferring now; the next receiver is one too many.
        assert!(matches!(slot.register_receiver(), ReceiverRegister::Rejected));
    }

    #[test]
    fn second_sender_conflicts() {
        let slot = Slot::new("/data".into());
        assert!(matches!(
            slot.register_sender(sender_entry(1)),
            SenderRegister::Admitted(None)
        ));
        assert!(matches!(
            slot.register_sender(sender_entry(1)),
            SenderRegister::Conflict
        ));
    }

    #[tokio::test]
    async fn queued_receivers_classified_fifo_on_sender_arrival() {
        let slot = Slot::new("/data".into());
        let mut pending = Vec::new();
        for _ in 0..4 {
            let ReceiverRegister::Pending(_, rx, launch) = slot.register_receiver() else {
                panic!("receivers queue without a cap before the sender");
            };
            assert!(launch.is_none());
            pending.push(rx);
        }

        let SenderRegister::Admitted(Some(launch)) = slot.register_sender(sender_entry(2)) else {
            panic!("sender with enough receivers queued must launch");
        };
        assert_eq!(launch.receivers.len(), 2);

        // Receivers three and four were classified out, in arrival order.
        let late: Vec<_> = pending.split_off(2);
        for rx in late {
            let response = rx.await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        // The first two are still waiting on the pump.
        for mut rx in pending {
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn sender_sees_retry_after_done() {
        let slot = Slot::new("/data".into());
        slot.inner.lock().unwrap().phase = Phase::Done;
        assert!(matches!(
            slot.register_sender(sender_entry(1)),
            SenderRegister::Retry(_)
        ));
        assert!(matches!(slot.register_receiver(), ReceiverRegister::Retry));
    }
}
