use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use instant_protocol::cli::{open_transport, ProtocolArgs, VerbosityArgs};
use instant_protocol::config::ServerConfig;
use instant_protocol::server::server_controller::ServerController;
use instant_protocol::server::server_driver::run_server;
use instant_protocol::util::random::RngRandom;
use tokio::sync::broadcast;
use tracing::{error, Level};

/// Instant messaging server
#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:1313")]
    bind: SocketAddr,

    #[clap(flatten)]
    protocol: ProtocolArgs,

    #[clap(flatten)]
    verbosity: VerbosityArgs,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.verbosity.init_logging(Level::INFO);

    let mut config = ServerConfig::new(args.bind);
    config.protocol = args.protocol.to_config();
    config.validate()?;

    let transport = open_transport(config.bind_addr, &config.protocol).await?;
    let controller = ServerController::new(Arc::new(config.protocol), transport, &mut RngRandom::from_entropy());

    let (shutdown_sender, shutdown_receiver) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_sender.send(());
            }
            Err(e) => error!("cannot listen for ctrl-c: {}", e),
        }
    });

    run_server(controller, shutdown_receiver).await
}
