//! HTTP data rendezvous relay.
//!
//! A sender uploads a byte stream to an arbitrary URL path with POST or PUT;
//! one or more receivers issue GET for the same path and get exactly the
//! bytes the sender transmitted, streamed through the process without any
//! persistence. Every path that is not reserved acts as a one-shot channel:
//! once a transfer completes the path becomes reusable, but past transfers
//! are gone.

pub mod config;
pub mod error;
pub mod relay;
pub mod server;

pub use config::ServerConfig;
pub use error::Error;
pub use server::PipingServer;

/// Version string served by `GET /version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
