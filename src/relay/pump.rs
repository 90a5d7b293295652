use super::{
    handle::{Frame, RelayError, SenderMeta},
    registry::Registry,
    slot::{Launch, ReceiverEntry, SenderEntry, Slot},
};
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Streams one sender body to every admitted receiver, then retires the
/// slot.
///
/// Each receiver gets a bounded channel feeding its response body, so the
/// pump's memory footprint is one in-flight chunk per receiver and the
/// effective transfer rate is the slowest live receiver's.
pub(crate) struct Transfer {
    registry: Arc<Registry>,
    slot: Arc<Slot>,
    sender: SenderEntry,
    receivers: Vec<ReceiverEntry>,
}

impl Transfer {
    pub fn new(registry: Arc<Registry>, slot: Arc<Slot>, launch: Launch) -> Self {
        Self {
            registry,
            slot,
            sender: launch.sender,
            receivers: launch.receivers,
        }
    }

    pub async fn run(self) {
        let Self {
            registry,
            slot,
            sender,
            receivers,
        } = self;
        let n = receivers.len();

        // Commit every receiver's headers before any body byte flows. A
        // receiver whose handler already went away is dropped from the
        // fan-out set here.
        let mut outs: Vec<mpsc::Sender<Frame>> = Vec::with_capacity(n);
        for receiver in receivers {
            let (tx, rx) = mpsc::channel(1);
            if receiver.commit(receiver_response(&sender.meta, rx)).is_ok() {
                outs.push(tx);
            }
        }

        sender
            .notice
            .write(&format!("Start sending to {n} receiver(s)!"))
            .await;

        let mut body = sender.body;
        let mut total: u64 = 0;
        let mut aborted = false;
        while let Some(item) = body.next().await {
            match item {
                Ok(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    total += chunk.len() as u64;
                    let mut i = 0;
                    while i < outs.len() {
                        if outs[i].send(Ok(chunk.clone())).await.is_ok() {
                            i += 1;
                        } else {
                            tracing::debug!("receiver disconnected mid-transfer");
                            outs.swap_remove(i);
                        }
                    }
                    // With no receivers left the loop keeps reading, which
                    // drains and discards the rest of the sender body.
                }
                Err(error) => {
                    tracing::debug!(%error, "sender body ended before end-of-stream");
                    aborted = true;
                    break;
                }
            }
        }

        if aborted {
            // Receivers must observe the truncation rather than a clean end
            // of body.
            for out in &outs {
                let _ = out.send(Err(RelayError::SenderAborted)).await;
            }
        } else if outs.is_empty() {
            sender.notice.write("All receiver(s) were disconnected.").await;
        } else {
            sender.notice.write("Sent.").await;
        }
        tracing::info!(bytes = total, receivers = n, aborted, "transfer finished");

        slot.finish(&registry);
    }
}

fn receiver_response(meta: &SenderMeta, rx: mpsc::Receiver<Frame>) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);
    if let Some(length) = &meta.content_length {
        builder = builder.header(header::CONTENT_LENGTH, length.clone());
    }
    if let Some(content_type) = &meta.content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type.clone());
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}
