use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the rendezvous server, tracking participants and relaying broadcasts.
    Server(ServerArgs),
    /// Connect to a server and participate in the chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:7777")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname used when joining the chat. Must be unique on the server.
    #[arg(long)]
    pub nickname: String,

    /// Address of the rendezvous server to connect to.
    #[arg(long, default_value = "127.0.0.1:7777")]
    pub server: SocketAddr,

    /// UDP port for receiving peer invitations. 0 picks an ephemeral port.
    #[arg(long, default_value_t = 0)]
    pub udp_port: u16,

    /// TCP port for accepting direct peer connections. 0 picks an ephemeral port.
    #[arg(long, default_value_t = 0)]
    pub peer_port: u16,
}
