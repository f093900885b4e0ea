use tokio::select;
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info};

use crate::messaging::transport::MAX_DATAGRAM_SIZE;
use crate::server::server_controller::ServerController;

/// Runs the server's event loop until a shutdown signal is received. All inbound datagrams and
///  timer expirations are handled here, one at a time.
pub async fn run_server(mut controller: ServerController, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let transport = controller.transport();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    info!("server listening on {:?}", transport.local_addr()?);

    loop {
        let deadline = controller.next_deadline();
        let timer = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        select! {
            received = transport.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => controller.on_datagram(&buf[..len], from, Instant::now()).await,
                    Err(e) => {
                        // e.g. ICMP port unreachable reported for an earlier send on some platforms
                        error!("error receiving datagram: {}", e);
                    }
                }
            }
            _ = timer => {
                controller.on_timer(Instant::now()).await;
            }
            _ = shutdown.recv() => {
                info!("shutting down server");
                break;
            }
        }
    }
    Ok(())
}
