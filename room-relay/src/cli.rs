use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::server::DEFAULT_QUEUE_CAPACITY;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the router, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a router from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Outbound messages buffered per session before it is disconnected.
    /// Values below 4 are raised to 4.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Room every user joins on login.
    #[arg(long, default_value = "general")]
    pub default_room: String,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the router to connect to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub server: SocketAddr,

    /// Directory where received files are written.
    #[arg(long, default_value = "downloads")]
    pub downloads: PathBuf,
}
