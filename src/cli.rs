use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tracing::{info, Level};

use crate::config::ProtocolConfig;
use crate::messaging::transport::{LossyTransport, Transport, UdpTransport};
use crate::util::random::RngRandom;

/// Protocol tuning, shared by server and client
#[derive(Args, Debug, Clone)]
pub struct ProtocolArgs {
    /// percentage of outgoing datagrams to drop on purpose, for testing
    #[clap(long, default_value_t = 0)]
    pub loss_rate: u8,

    /// retransmissions before a peer is considered unreachable
    #[clap(long, default_value_t = 5)]
    pub max_retries: u32,

    #[clap(long, default_value_t = 500)]
    pub retransmit_millis: u64,

    #[clap(long, default_value_t = 15)]
    pub invitation_secs: u64,
}

impl ProtocolArgs {
    pub fn to_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            retransmit_interval: Duration::from_millis(self.retransmit_millis),
            max_retries: self.max_retries,
            invitation_timeout: Duration::from_secs(self.invitation_secs),
            loss_rate_percent: self.loss_rate,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct VerbosityArgs {
    #[clap(short, long, default_value_t = false)]
    pub verbose: bool,

    #[clap(long, default_value_t = false)]
    pub very_verbose: bool,
}

impl VerbosityArgs {
    pub fn level(&self, default: Level) -> Level {
        match (self.verbose, self.very_verbose) {
            (_, true) => Level::TRACE,
            (true, _) => Level::DEBUG,
            (false, false) => default,
        }
    }

    /// Logs go to stderr so they do not get mixed up with chat output
    pub fn init_logging(&self, default: Level) {
        tracing_subscriber::fmt()
            .with_max_level(self.level(default))
            .with_writer(std::io::stderr)
            .try_init()
            .ok();
    }
}

/// Binds a UDP socket, wrapped for simulated datagram loss if the configuration asks for it
pub async fn open_transport(bind_addr: SocketAddr, config: &ProtocolConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let udp: Arc<dyn Transport> = Arc::new(UdpTransport::bind(bind_addr).await?);
    if config.loss_rate_percent == 0 {
        return Ok(udp);
    }

    info!(loss_rate_percent = config.loss_rate_percent, "simulating datagram loss");
    Ok(Arc::new(LossyTransport::new(udp, config.loss_rate_percent, Box::new(RngRandom::from_entropy()))))
}
