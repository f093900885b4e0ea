use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use crate::client::client_controller::ClientController;
use crate::client::client_events::ClientEvent;
use crate::messaging::transport::MAX_DATAGRAM_SIZE;

/// Runs the client's event loop until the client is disconnected. Lines of user input arrive
///  through `input`; if that channel is closed, the client disconnects.
pub async fn run_client(mut controller: ClientController, mut input: mpsc::Receiver<String>) -> anyhow::Result<()> {
    let transport = controller.transport();
    let notifier = controller.notifier();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut input_closed = false;

    info!("client bound to {:?}", transport.local_addr()?);

    while !controller.is_finished() {
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
                    Err(e) => error!("error receiving datagram: {}", e),
                }
            }
            _ = timer => {
                controller.on_timer(Instant::now()).await;
            }
            line = input.recv(), if !input_closed => {
                match line {
                    Some(line) => {
                        if let Err(error) = controller.on_user_input(&line, Instant::now()).await {
                            debug!("rejected user input: {}", error);
                            notifier.send_event(ClientEvent::InputRejected { error });
                        }
                    }
                    None => {
                        debug!("end of user input - disconnecting");
                        input_closed = true;
                        if let Err(error) = controller.disconnect(Instant::now()).await {
                            debug!("not disconnecting at end of input: {}", error);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
