use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace};

use crate::messaging::message::Message;
use crate::util::random::Random;

/// Datagrams are small: a full user list of 255 peers is well below this
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

/// Unreliable datagram transport. Reliability is layered on top of this by
///  [crate::messaging::reliable_session::ReliableSession].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    /// waits for the next datagram. This is cancellation safe, so it can be used in `select!`
    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

/// Encodes and sends a message, logging (rather than returning) failures: the caller's ARQ
///  handles lost datagrams regardless of the reason
pub async fn send_message(transport: &dyn Transport, to: SocketAddr, msg: &Message) {
    trace!(?to, kind = ?msg.kind(), ack = msg.is_ack(), sequence = ?msg.sequence, "sending message");
    if let Err(e) = transport.send_to(to, &msg.encode()).await {
        error!("error sending message to {:?}: {}", to, e);
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
}
impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);
        Ok(UdpTransport { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(buf, to).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Wraps a transport, dropping a configurable percentage of *outgoing* datagrams to simulate an
///  unreliable network. Receiving is passed through unchanged.
pub struct LossyTransport {
    inner: Arc<dyn Transport>,
    loss_rate_percent: u8,
    random: Mutex<Box<dyn Random>>,
}
impl LossyTransport {
    pub fn new(inner: Arc<dyn Transport>, loss_rate_percent: u8, random: Box<dyn Random>) -> LossyTransport {
        LossyTransport {
            inner,
            loss_rate_percent,
            random: Mutex::new(random),
        }
    }

    fn should_drop(&self) -> bool {
        if self.loss_rate_percent == 0 {
            return false;
        }
        let mut random = self.random.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        random.gen_percent() <= self.loss_rate_percent
    }
}

#[async_trait]
impl Transport for LossyTransport {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        if self.should_drop() {
            debug!(?to, "simulated packet loss - dropping outgoing datagram");
            return Ok(());
        }
        self.inner.send_to(to, buf).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
