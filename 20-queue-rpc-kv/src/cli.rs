use std::{net::SocketAddr, num::NonZeroUsize, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::{
    client::ClientConfig,
    command::{ADD_ITEM, Command, GET_ALL_ITEMS, GET_ITEM, REMOVE_ITEM},
    server::ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// Run the message broker, accepting local TCP connections.
    Broker(BrokerArgs),
    /// Consume requests from the broker and serve them from the store.
    Server(ServerArgs),
    /// Send one command to the server and print its reply.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5672")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address of the broker to connect to.
    #[arg(long, default_value = "127.0.0.1:5672")]
    pub broker: SocketAddr,

    /// Number of requests the server processes concurrently.
    #[arg(short = 't', long = "threads", default_value = "4")]
    pub threads: NonZeroUsize,

    /// Delay added to every request, in milliseconds.
    #[arg(short = 'd', long = "delay", default_value_t = 0)]
    pub delay_ms: u64,

    /// Also append warnings and errors to this file.
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            concurrency: self.threads.get(),
            delay: Duration::from_millis(self.delay_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the broker to connect to.
    #[arg(long, default_value = "127.0.0.1:5672")]
    pub broker: SocketAddr,

    /// Give up waiting for the reply after this many milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(value_enum)]
    pub command: CommandKind,

    pub key: Option<String>,

    pub value: Option<String>,
}

impl ClientArgs {
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn to_command(&self) -> anyhow::Result<Command> {
        Command::parse(
            self.command.wire_name(),
            self.key.clone(),
            self.value.clone(),
        )
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Add an item to the store.
    Add,
    /// Remove an item from the store.
    Remove,
    /// Read one item.
    Get,
    /// Read every item, in insertion order.
    #[value(name = "getall")]
    GetAll,
}

impl CommandKind {
    pub fn wire_name(self) -> &'static str {
        match self {
            CommandKind::Add => ADD_ITEM,
            CommandKind::Remove => REMOVE_ITEM,
            CommandKind::Get => GET_ITEM,
            CommandKind::GetAll => GET_ALL_ITEMS,
        }
    }
}
