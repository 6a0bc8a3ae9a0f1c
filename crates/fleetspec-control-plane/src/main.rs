//! fleetspec Control Plane Server

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use fleetspec_control_plane::{http, service, AppState, Config, Scheduler};

/// fleetspec scheduler
#[derive(Parser, Debug)]
#[command(name = "fleetspec-control-plane", about = "fleetspec scheduler service")]
struct Args {
    /// JSON-lines RPC bind address
    #[arg(long)]
    bind_addr: Option<String>,

    /// HTTP admin bind address
    #[arg(long)]
    http_bind_addr: Option<String>,

    /// Seconds after which a silent worker is dropped
    #[arg(long)]
    worker_staleness_secs: Option<u64>,

    /// Seconds a duration average stays cached
    #[arg(long)]
    average_ttl_secs: Option<u64>,

    /// Seconds one call may take before it is answered with a timeout
    #[arg(long)]
    call_timeout_secs: Option<u64>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,
}

impl Args {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            bind_addr: self.bind_addr.unwrap_or(defaults.bind_addr),
            http_bind_addr: self.http_bind_addr.unwrap_or(defaults.http_bind_addr),
            worker_staleness_secs: self
                .worker_staleness_secs
                .unwrap_or(defaults.worker_staleness_secs),
            average_ttl_secs: self.average_ttl_secs.unwrap_or(defaults.average_ttl_secs),
            call_timeout_secs: self.call_timeout_secs.unwrap_or(defaults.call_timeout_secs),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = args.into_config();
    let rpc_addr: SocketAddr = config.bind_addr.parse()?;
    let http_addr: SocketAddr = config.http_bind_addr.parse()?;

    let state = AppState::new(config);
    let scheduler = Arc::new(Scheduler::new(state.clone()));

    info!(rpc_addr = %rpc_addr, http_addr = %http_addr, "Starting fleetspec control plane");

    let rpc_listener = TcpListener::bind(rpc_addr).await?;
    let rpc_server = service::serve(rpc_listener, scheduler);

    let http_listener = TcpListener::bind(http_addr).await?;
    let http_server = axum::serve(http_listener, http::create_router(state));

    info!("RPC server listening on {}", rpc_addr);
    info!("HTTP server listening on {} (admin)", http_addr);

    // Run both servers concurrently
    tokio::select! {
        result = rpc_server => {
            if let Err(e) = result {
                error!(error = %e, "RPC server error");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
    }

    Ok(())
}
