use super::{
    handle::{ByteStream, GuardedStream, NoticeWriter, SenderMeta},
    pump::Transfer,
    slot::{
        self, Launch, ReceiverGuard, ReceiverRegister, SenderEntry, SenderGuard, SenderRegister,
        Slot,
    },
};
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::Instrument;

/// Process-wide mapping from path to its live rendezvous slot.
///
/// The map mutex only covers lookup, creation and removal; a slot's own work
/// always happens after it is released. Slots remove themselves on
/// termination, and removal checks identity so a successor slot created for
/// the same path is never torn down by its predecessor.
pub struct Registry {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lookup_or_create(&self, path: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(path) {
            Arc::clone(slot)
        } else {
            let slot = Arc::new(Slot::new(path.to_owned()));
            slots.insert(path.to_owned(), Arc::clone(&slot));
            tracing::trace!(path, "created slot");
            slot
        }
    }

    /// Removes the slot only if it is still the current mapping for its
    /// path.
    pub(crate) fn remove(&self, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock().unwrap();
        if slots
            .get(slot.path())
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(slot.path());
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Admits a sender on `path`.
    ///
    /// Returns the sender's response: 400 when the slot already has a
    /// sender, otherwise an immediately-committed 200 whose plain-text body
    /// streams progress lines for the lifetime of the transfer.
    pub fn admit_sender(self: &Arc<Self>, path: &str, meta: SenderMeta, body: ByteStream) -> Response {
        let n = meta.capacity;
        let (notice, notice_rx) = NoticeWriter::channel();
        let mut entry = SenderEntry { meta, body, notice };
        loop {
            let slot = self.lookup_or_create(path);
            match slot.register_sender(entry) {
                SenderRegister::Admitted(launch) => {
                    tracing::debug!(path, n = n.get(), "sender admitted");
                    if let Some(launch) = launch {
                        self.launch(Arc::clone(&slot), launch);
                    }
                    let guard = SenderGuard::new(Arc::clone(self), slot);
                    return Response::builder()
                        .status(StatusCode::OK)
                        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                        .body(Body::from_stream(GuardedStream::new(notice_rx, guard)))
                        .unwrap();
                }
                SenderRegister::Conflict => {
                    tracing::debug!(path, "rejecting second sender");
                    return (
                        StatusCode::BAD_REQUEST,
                        format!("[ERROR] Another sender is already connected on {path:?}.\n"),
                    )
                        .into_response();
                }
                // Lost the race against a finishing transfer; the path is
                // fresh again on the next lookup.
                SenderRegister::Retry(returned) => entry = returned,
            }
        }
    }

    /// Admits a receiver on `path` and waits until the transfer commits its
    /// response or the slot rejects it. Dropping the returned future
    /// unregisters the receiver.
    pub async fn admit_receiver(self: &Arc<Self>, path: &str) -> Response {
        let (guard, rx) = loop {
            let slot = self.lookup_or_create(path);
            match slot.register_receiver() {
                ReceiverRegister::Pending(id, rx, launch) => {
                    tracing::debug!(path, "receiver admitted");
                    let guard = ReceiverGuard::new(Arc::clone(self), Arc::clone(&slot), id);
                    if let Some(launch) = launch {
                        self.launch(slot, launch);
                    }
                    break (guard, rx);
                }
                ReceiverRegister::Rejected => {
                    tracing::debug!(path, "rejecting over-capacity receiver");
                    return slot::too_many_receivers(path);
                }
                ReceiverRegister::Retry => {}
            }
        };

        let _guard = guard;
        match rx.await {
            Ok(response) => response,
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    fn launch(self: &Arc<Self>, slot: Arc<Slot>, launch: Launch) {
        let span = tracing::info_span!("transfer", path = slot.path());
        let transfer = Transfer::new(Arc::clone(self), slot, launch);
        tokio::spawn(transfer.run().instrument(span));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::handle::ByteStream;
    use bytes::Bytes;
    use futures_util::future::poll_immediate;
    use std::num::NonZeroUsize;

    fn meta(n: usize) -> SenderMeta {
        SenderMeta {
            capacity: NonZeroUsize::new(n).unwrap(),
            content_length: None,
            content_type: None,
        }
    }

    fn body(content: &'static str) -> ByteStream {
        ByteStream::from_iter([Bytes::from_static(content.as_bytes())])
    }

    #[tokio::test]
    async fn duplicate_sender_is_rejected() {
        let registry = Arc::new(Registry::new());
        let first = registry.admit_sender("/key", meta(1), body("a"));
        assert_eq!(first.status(), StatusCode::OK);
        let second = registry.admit_sender("/key", meta(1), body("b"));
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dropping_pending_receiver_disposes_slot() {
        let registry = Arc::new(Registry::new());
        let mut pending = Box::pin(registry.admit_receiver("/key"));
        assert!(poll_immediate(&mut pending).await.is_none());
        assert_eq!(registry.len(), 1);

        drop(pending);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn dropping_waiting_sender_response_disposes_slot() {
        let registry = Arc::new(Registry::new());
        let response = registry.admit_sender("/key", meta(1), body("a"));
        assert_eq!(registry.len(), 1);

        // Dropping the response body is what the transport does when the
        // sending client hangs up while parked.
        drop(response);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn removal_is_identity_checked() {
        let registry = Arc::new(Registry::new());
        let stale = registry.lookup_or_create("/key");
        registry.remove(&stale);
        assert_eq!(registry.len(), 0);

        let fresh = registry.lookup_or_create("/key");
        registry.remove(&stale);
        assert_eq!(registry.len(), 1, "a stale slot must not evict its successor");
        registry.remove(&fresh);
        assert_eq!(registry.len(), 0);
    }
}
