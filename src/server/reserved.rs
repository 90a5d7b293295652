use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

/// Paths with fixed server-side semantics. They share the namespace with
/// rendezvous paths but never reach the registry.
const RESERVED_PATHS: [&str; 3] = ["", "/", "/version"];

pub(crate) fn is_reserved(path: &str) -> bool {
    RESERVED_PATHS.contains(&path)
}

pub(crate) fn index() -> Response {
    Html(INDEX_HTML).into_response()
}

pub(crate) fn version() -> Response {
    (StatusCode::OK, format!("{}\n", crate::VERSION)).into_response()
}

pub(crate) fn reject_non_get(path: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        format!("[ERROR] Cannot send to reserved paths ({path:?}).\n"),
    )
        .into_response()
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Piping Server</title>
</head>
<body>
  <h1>Piping Server</h1>
  <p>Stream data from one client to another through this server. No data is stored.</p>
  <h2>Usage</h2>
  <pre>
  # Send
  curl -T myfile http://localhost:8080/mypath

  # Receive
  curl http://localhost:8080/mypath &gt; myfile

  # Fan out to three receivers
  curl -T myfile "http://localhost:8080/mypath?n=3"
  </pre>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_set() {
        assert!(is_reserved(""));
        assert!(is_reserved("/"));
        assert!(is_reserved("/version"));
        assert!(!is_reserved("/mydataid"));
        assert!(!is_reserved("/version/x"));
    }

    #[test]
    fn index_identifies_the_service() {
        assert!(INDEX_HTML.contains("Piping"));
    }
}
