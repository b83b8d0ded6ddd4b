use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracer::Tracer;

use crate::{
    client::ClientConfig,
    hub::{DEFAULT_MAILBOX_CAPACITY, HubConfig, OverflowPolicy},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the chat room over WebSocket.
    Serve(ServeArgs),
    /// Join a running room from the terminal.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to listen for HTTP requests on. Use port 0 for an ephemeral port.
    #[arg(long, env = "APP_ADDRESS", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Number of messages each client may have queued before overflow kicks in.
    #[arg(long, default_value_t = DEFAULT_MAILBOX_CAPACITY)]
    pub mailbox_capacity: usize,

    /// What to do when a client's mailbox is full.
    #[arg(long, value_enum, default_value_t = Overflow::Drop)]
    pub overflow: Overflow,

    /// How long `--overflow disconnect` waits on a full mailbox.
    #[arg(long, default_value_t = 1000)]
    pub stall_timeout_ms: u64,

    /// Disconnect clients that send nothing for this many seconds.
    #[arg(long)]
    pub read_timeout_secs: Option<u64>,

    /// Disconnect clients whose socket does not accept a message within this many seconds.
    #[arg(long)]
    pub write_timeout_secs: Option<u64>,

    /// Where room trace events go.
    #[arg(long, value_enum, default_value_t = TraceTarget::Stdout)]
    pub trace: TraceTarget,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    Drop,
    Block,
    Disconnect,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceTarget {
    Stdout,
    Log,
    Off,
}

impl ServeArgs {
    pub fn hub_config(&self) -> HubConfig {
        let overflow = match self.overflow {
            Overflow::Drop => OverflowPolicy::Drop,
            Overflow::Block => OverflowPolicy::Block,
            Overflow::Disconnect => {
                OverflowPolicy::Disconnect(Duration::from_millis(self.stall_timeout_ms))
            }
        };

        HubConfig {
            mailbox_capacity: self.mailbox_capacity,
            overflow,
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            read_timeout: self.read_timeout_secs.map(Duration::from_secs),
            write_timeout: self.write_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn tracer(&self) -> Box<dyn Tracer> {
        match self.trace {
            TraceTarget::Stdout => tracer::new(std::io::stdout()),
            TraceTarget::Log => tracer::log(),
            TraceTarget::Off => tracer::off(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// WebSocket URL of the room.
    #[arg(long, default_value = "ws://127.0.0.1:8080/room")]
    pub server: String,

    /// Display name shown next to your messages.
    #[arg(long)]
    pub name: String,

    /// Optional avatar image URL.
    #[arg(long)]
    pub avatar_url: Option<String>,
}
