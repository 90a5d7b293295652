use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    ParseError(#[from] config::ConfigError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("cannot resolve listen address {0:?}")]
    Unresolvable(String),
}

/// Configuration for a relay server instance.
///
/// The relay holds no durable state, so this is deliberately small: where to
/// listen, and nothing else. TLS termination and process supervision live
/// outside this crate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind. Accepts an IP address or a resolvable name.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on. Use 0 to let the kernel assign one.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Reads config from string. Expects config to be toml format.
    /// To read file, use `fs::read_to_string`
    ///
    /// # Errors
    /// if `input` is in an invalid format
    pub fn from_toml_str(input: &str) -> Result<Self, Error> {
        use config::{Config, File, FileFormat};

        let conf: Self = Config::builder()
            .add_source(File::from_str(input, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        Ok(conf)
    }

    /// Resolves `host:port` into a socket address.
    ///
    /// # Errors
    /// if the host does not parse or resolve
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or(Error::Unresolvable(addr))
    }
}
