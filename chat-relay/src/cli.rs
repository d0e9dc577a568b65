use std::{net::SocketAddr, time::Duration};

use clap::Parser;

use crate::config::{
    DEFAULT_HOST, DEFAULT_MAX_LINE_BYTES, DEFAULT_PORT, DEFAULT_WELCOME, RelayConfig,
};

/// Relay every line a client sends to all other connected clients.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerArgs {
    /// Address the relay should bind to.
    #[arg(long, env = "RELAY_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "RELAY_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Greeting sent to each client on connect. Pass an empty string to disable.
    #[arg(long, default_value = DEFAULT_WELCOME)]
    pub welcome: String,

    /// Longest line a client may send, in bytes, not counting the newline.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    pub max_line_bytes: usize,

    /// Milliseconds to wait on a single client write before dropping that client.
    #[arg(long, default_value_t = 5000)]
    pub send_timeout_ms: u64,

    /// Milliseconds shutdown waits for connection tasks to wind down.
    #[arg(long, default_value_t = 2000)]
    pub shutdown_grace_ms: u64,

    /// Consecutive accept failures tolerated before the server stops.
    #[arg(long, default_value_t = 32)]
    pub max_accept_failures: u32,
}

impl From<ServerArgs> for RelayConfig {
    fn from(args: ServerArgs) -> Self {
        let welcome = (!args.welcome.is_empty()).then_some(args.welcome);
        Self {
            host: args.host,
            port: args.port,
            welcome,
            max_line_bytes: args.max_line_bytes,
            send_timeout: Duration::from_millis(args.send_timeout_ms),
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
            max_accept_failures: args.max_accept_failures,
        }
    }
}

/// Connect to a relay and chat from the terminal.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:55555")]
    pub server: SocketAddr,

    /// Display name prefixed to outgoing lines. Prompted for when omitted.
    #[arg(long)]
    pub name: Option<String>,
}
