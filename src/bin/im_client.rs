use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use instant_protocol::cli::{open_transport, ProtocolArgs, VerbosityArgs};
use instant_protocol::client::client_controller::ClientController;
use instant_protocol::client::client_driver::run_client;
use instant_protocol::client::client_events::{ClientEvent, ClientEventNotifier};
use instant_protocol::config::ClientConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, warn, Level};

/// Instant messaging client. Type /help once connected for a list of commands.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:1313")]
    server: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// connect right away instead of asking for a username
    #[clap(long)]
    username: Option<String>,

    #[clap(flatten)]
    protocol: ProtocolArgs,

    #[clap(flatten)]
    verbosity: VerbosityArgs,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.verbosity.init_logging(Level::WARN);

    let mut config = ClientConfig::new(args.server);
    config.bind_addr = args.bind;
    config.protocol = args.protocol.to_config();
    config.validate()?;

    let transport = open_transport(config.bind_addr, &config.protocol).await?;
    let notifier = Arc::new(ClientEventNotifier::new());
    let printer = tokio::spawn(print_events(notifier.subscribe()));
    let controller = ClientController::new(Arc::new(config.protocol), transport, config.server_addr, notifier);

    let (input_sender, input_receiver) = mpsc::channel(16);
    match args.username {
        Some(username) => input_sender.send(username).await?,
        None => println!("username:"),
    }

    let ctrl_c_sender = input_sender.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = ctrl_c_sender.send("/exit".to_string()).await;
            }
            Err(e) => error!("cannot listen for ctrl-c: {}", e),
        }
    });
    tokio::spawn(read_lines(input_sender));

    let result = run_client(controller, input_receiver).await;
    // the printer finishes once the controller and its notifier are gone
    let _ = printer.await;
    result
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                println!("{}", event);
                if matches!(event, ClientEvent::ConnectionRejected { .. }) {
                    println!("username:");
                }
            }
            Err(RecvError::Lagged(num_skipped)) => warn!("{} events were not displayed", num_skipped),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn read_lines(input: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if input.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = input.send("/exit".to_string()).await;
                break;
            }
            Err(e) => {
                error!("error reading input: {}", e);
                break;
            }
        }
    }
}
