use clap::Parser;
use n0_error::Result;
use shiplink::offshore::OffshoreProxy;
use tokio::net::TcpListener;
use tracing::info;

/// Offshore-side proxy: receives framed requests from the ship over the
/// single link and performs the actual egress to the Internet.
#[derive(Parser, Debug)]
#[command(name = "offshore-proxy")]
struct Cli {
    /// Address to listen on for the ship link.
    #[clap(long, default_value = "0.0.0.0")]
    listen_host: String,
    /// Port to listen on for the ship link.
    #[clap(long, default_value_t = shiplink::DEFAULT_LINK_PORT)]
    listen_port: u16,
    /// Enable verbose logging.
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let listener = TcpListener::bind((cli.listen_host.as_str(), cli.listen_port)).await?;
    info!("offshore proxy listening on {}", listener.local_addr()?);

    let proxy = OffshoreProxy::new();
    tokio::select! {
        res = proxy.serve(listener) => res?,
        _ = shutdown_signal() => info!("shutting down"),
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
