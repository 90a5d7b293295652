//! The rendezvous and streaming core.
//!
//! A [`Registry`] maps each live path to a slot; the slot is a small state
//! machine pairing exactly one sender with the number of receivers the
//! sender asked for, in whatever order they arrive. Once the rendezvous is
//! complete a pump task fans the sender's body out to every receiver with
//! per-receiver backpressure, then the slot removes itself and the path is
//! free again.

mod handle;
mod pump;
mod registry;
mod slot;

pub use handle::{ByteStream, RelayError, SenderMeta};
pub use registry::Registry;
