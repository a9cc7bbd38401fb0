use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{broker::BrokerConfig, command::Visibility};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the rendezvous broker, accepting TCP connections from clients.
    Broker(BrokerArgs),
    /// Register with a broker, find peers and chat with them directly.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Seconds a requester waits for the target to answer a connection request.
    #[arg(long, default_value_t = 30)]
    pub reply_timeout_secs: u64,
}

impl BrokerArgs {
    pub fn config(&self) -> BrokerConfig {
        BrokerConfig {
            reply_timeout: Duration::from_secs(self.reply_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identity to register with. The broker appends a suffix if it is taken.
    #[arg(long)]
    pub id: String,

    /// Address of the broker to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,

    /// Whether other clients can find you with LIST_CLIENTS (public or private).
    #[arg(long, default_value = "public")]
    pub visibility: Visibility,
}
