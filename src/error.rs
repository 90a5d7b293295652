//! Crate error types.
//!
//! Protocol misuse never surfaces here: the relay expresses it as HTTP 400
//! responses at the slot boundary. What remains is the small set of faults
//! that can stop the server itself from coming up or staying up.

pub use crate::config::Error as ConfigError;
pub use crate::relay::RelayError;

/// Error launching or running the relay server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
