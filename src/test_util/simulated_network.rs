use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::messaging::transport::Transport;

#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub buf: Vec<u8>,
}

/// An in-memory network: datagrams sent through any of its endpoints are queued until the test
///  delivers them, which gives tests full control over ordering and timing
#[derive(Default)]
pub struct SimulatedNetwork {
    in_flight: RwLock<VecDeque<Datagram>>,
}
impl SimulatedNetwork {
    pub fn new() -> Arc<SimulatedNetwork> {
        Arc::new(SimulatedNetwork::default())
    }

    pub fn endpoint(self: &Arc<Self>, addr: SocketAddr) -> Arc<SimulatedEndpoint> {
        Arc::new(SimulatedEndpoint {
            addr,
            network: self.clone(),
        })
    }

    pub async fn next_datagram(&self) -> Option<Datagram> {
        self.in_flight.write().await
            .pop_front()
    }

    pub async fn num_in_flight(&self) -> usize {
        self.in_flight.read().await
            .len()
    }
}

pub struct SimulatedEndpoint {
    addr: SocketAddr,
    network: Arc<SimulatedNetwork>,
}

#[async_trait]
impl Transport for SimulatedEndpoint {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        trace!(from = ?self.addr, ?to, len = buf.len(), "simulated send");
        self.network.in_flight.write().await
            .push_back(Datagram {
                from: self.addr,
                to,
                buf: buf.to_vec(),
            });
        Ok(())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        std::future::pending().await
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagrams_are_queued_in_order() {
        let network = SimulatedNetwork::new();
        let a = network.endpoint(SocketAddr::from(([127, 0, 0, 1], 1)));
        let b = network.endpoint(SocketAddr::from(([127, 0, 0, 1], 2)));

        a.send_to(b.local_addr().unwrap(), &[1]).await.unwrap();
        b.send_to(a.local_addr().unwrap(), &[2]).await.unwrap();
        assert_eq!(network.num_in_flight().await, 2);

        let first = network.next_datagram().await.unwrap();
        assert_eq!(first.from, a.local_addr().unwrap());
        assert_eq!(first.to, b.local_addr().unwrap());
        assert_eq!(first.buf, vec![1]);

        let second = network.next_datagram().await.unwrap();
        assert_eq!(second.buf, vec![2]);
        assert!(network.next_datagram().await.is_none());
    }
}
