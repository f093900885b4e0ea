use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// time to wait for an ACK before a reliably sent message is transmitted again
    pub retransmit_interval: Duration,
    /// number of retransmissions after the initial transmission before the peer is considered
    ///  unreachable
    pub max_retries: u32,
    /// time an invitee has to answer a group invitation - used both by the invitee and by the server
    pub invitation_timeout: Duration,
    /// percentage of outgoing datagrams that are dropped on purpose, for testing on a reliable
    ///  network
    pub loss_rate_percent: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            retransmit_interval: Duration::from_millis(500),
            max_retries: 5,
            invitation_timeout: Duration::from_secs(15),
            loss_rate_percent: 0,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_interval.is_zero() {
            bail!("retransmit interval must be positive");
        }
        if self.invitation_timeout.is_zero() {
            bail!("invitation timeout must be positive");
        }
        if self.loss_rate_percent > 100 {
            bail!("loss rate is a percentage and must not exceed 100, was {}", self.loss_rate_percent);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub protocol: ProtocolConfig,
}
impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_addr,
            protocol: ProtocolConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.bind_addr.is_ipv4() {
            bail!("the wire format carries IPv4 addresses only, cannot bind to {}", self.bind_addr);
        }
        self.protocol.validate()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub bind_addr: SocketAddr,
    pub protocol: ProtocolConfig,
}
impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            server_addr,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            protocol: ProtocolConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.server_addr.is_ipv4() || !self.bind_addr.is_ipv4() {
            bail!("the wire format carries IPv4 addresses only");
        }
        self.protocol.validate()
    }
}
