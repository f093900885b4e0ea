use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::messaging::message::Message;
use crate::messaging::transport::Transport;

/// Records every message that is sent, for verification by a test
#[derive(Debug)]
pub struct TrackingTransport {
    myself: SocketAddr,
    tracker: RwLock<Vec<(SocketAddr, Message)>>,
}
impl TrackingTransport {
    pub fn new(myself: SocketAddr) -> Self {
        TrackingTransport {
            myself,
            tracker: Default::default(),
        }
    }

    pub async fn assert_message_sent(&self, to: SocketAddr, message: Message) {
        let mut lock = self.tracker.write().await;
        if lock.is_empty() {
            panic!("no message was sent, expected {:?}", message);
        }

        let (actual_to, actual_msg) = lock.remove(0);
        assert_eq!(actual_msg, message);
        assert_eq!(actual_to, to);
    }

    pub async fn take_sent(&self) -> Vec<(SocketAddr, Message)> {
        std::mem::take(&mut *self.tracker.write().await)
    }

    pub async fn assert_no_remaining_messages(&self) {
        let lock = self.tracker.read().await;
        assert!(lock.is_empty(), "unexpected messages: {:?}", lock);
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    async fn send_to(&self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        let msg = Message::decode(buf)?;
        self.tracker.write().await.push((to, msg));
        Ok(())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        std::future::pending().await
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.myself)
    }
}
