use clap::Parser;
use piping_server::{PipingServer, ServerConfig};
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "piping-server", version, about = "HTTP data rendezvous relay")]
struct Args {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on. 0 asks the kernel to assign one.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// TOML config file. Overrides the flags above when present.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), piping_server::Error> {
    let conf = match &args.config {
        Some(path) => ServerConfig::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => ServerConfig {
            host: args.host,
            port: args.port,
        },
    };
    let listener = tokio::net::TcpListener::bind(conf.socket_addr()?).await?;
    PipingServer::new().serve(listener).await?;
    Ok(())
}
