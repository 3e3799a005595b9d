use clap::Parser;
use n0_error::Result;
use shiplink::ship::{LinkOpts, ShipCore};
use tokio::net::TcpListener;
use tracing::info;

/// Ship-side proxy: accepts local HTTP proxy clients and forwards their
/// requests sequentially over the single offshore link.
#[derive(Parser, Debug)]
#[command(name = "ship-proxy")]
struct Cli {
    /// Address to listen on for local proxy clients.
    #[clap(long, default_value = "0.0.0.0")]
    listen_host: String,
    /// Port to listen on for local proxy clients.
    #[clap(long, default_value_t = shiplink::DEFAULT_PROXY_PORT)]
    listen_port: u16,
    /// Offshore proxy host, reachable over the expensive link.
    #[clap(long, env = "OFFSHORE_HOST")]
    offshore_host: String,
    /// Offshore proxy link port.
    #[clap(long, env = "OFFSHORE_PORT", default_value_t = shiplink::DEFAULT_LINK_PORT)]
    offshore_port: u16,
    /// Enable verbose logging.
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let listener = TcpListener::bind((cli.listen_host.as_str(), cli.listen_port)).await?;
    info!("ship proxy listening on {}", listener.local_addr()?);
    info!(
        "forwarding to offshore proxy at {}:{}",
        cli.offshore_host, cli.offshore_port
    );

    let core = ShipCore::new(LinkOpts::new(cli.offshore_host, cli.offshore_port));
    tokio::select! {
        res = core.run(listener) => res?,
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
