//! HTTP surface of the relay: request classification and listener wiring.

mod reserved;

use crate::relay::{ByteStream, Registry, SenderMeta};
use axum::{
    extract::{Query, Request, State},
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use serde::Deserialize;
use std::{io, num::NonZeroUsize, sync::Arc};
use tokio::net::TcpListener;

/// The relay service. Owns the path registry and exposes it as an axum
/// router in which every non-reserved path is a rendezvous channel.
pub struct PipingServer {
    registry: Arc<Registry>,
}

impl Default for PipingServer {
    fn default() -> Self {
        Self::new()
    }
}

impl PipingServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
        }
    }

    /// Builds the service. The whole path namespace is dynamic, so a single
    /// fallback handler classifies every request instead of a route table.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&self.registry))
    }

    /// Serves on an already-bound listener. Binding is left to the caller so
    /// tests and operators can use port 0 and read back the assigned port.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, version = crate::VERSION, "piping server listening");
        }
        axum::serve(listener, self.router()).await
    }
}

/// Classifies one inbound request: reserved endpoint, sender, or receiver.
/// The returned future resolves only when the response is fully determined,
/// so a parked receiver suspends here until its transfer commits.
async fn handle(State(registry): State<Arc<Registry>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    if reserved::is_reserved(&path) {
        if method != Method::GET {
            return reserved::reject_non_get(&path);
        }
        return if path == "/version" {
            reserved::version()
        } else {
            reserved::index()
        };
    }

    if method == Method::POST || method == Method::PUT {
        let capacity = match parse_capacity(req.uri()) {
            Ok(n) => n,
            Err(message) => {
                tracing::debug!(%path, %message, "rejecting sender");
                return (StatusCode::BAD_REQUEST, format!("[ERROR] {message}\n")).into_response();
            }
        };
        let meta = SenderMeta {
            capacity,
            content_length: req.headers().get(header::CONTENT_LENGTH).cloned(),
            content_type: req.headers().get(header::CONTENT_TYPE).cloned(),
        };
        let body = ByteStream::from(req.into_body());
        registry.admit_sender(&path, meta, body)
    } else if method == Method::GET {
        registry.admit_receiver(&path).await
    } else {
        (
            StatusCode::BAD_REQUEST,
            format!("[ERROR] Unsupported method: {method}.\n"),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RelayQuery {
    n: Option<String>,
}

/// Parses the sender's receiver-count parameter. Absent means one; anything
/// that is not a positive integer is a protocol error and no slot may be
/// created for the request.
fn parse_capacity(uri: &Uri) -> Result<NonZeroUsize, String> {
    let Query(query) =
        Query::<RelayQuery>::try_from_uri(uri).map_err(|_| "malformed query string".to_owned())?;
    match query.n {
        None => Ok(NonZeroUsize::MIN),
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .and_then(NonZeroUsize::new)
            .ok_or_else(|| format!("invalid number of receivers: {raw:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity_of(uri: &str) -> Result<NonZeroUsize, String> {
        parse_capacity(&uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn capacity_defaults_to_one() {
        assert_eq!(capacity_of("/data").unwrap().get(), 1);
        assert_eq!(capacity_of("/data?other=x").unwrap().get(), 1);
    }

    #[test]
    fn capacity_parses_positive_integers() {
        assert_eq!(capacity_of("/data?n=3").unwrap().get(), 3);
        assert_eq!(capacity_of("/data?n=1").unwrap().get(), 1);
    }

    #[test]
    fn capacity_rejects_zero_negative_and_garbage() {
        assert!(capacity_of("/data?n=0").is_err());
        assert!(capacity_of("/data?n=-1").is_err());
        assert!(capacity_of("/data?n=abc").is_err());
        assert!(capacity_of("/data?n=1.5").is_err());
    }
}
