use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 55555;
pub const DEFAULT_WELCOME: &str = "Welcome to the Chat Server!";
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;

/// Runtime settings for [`RelayServer`](crate::server::RelayServer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    /// Port to listen on; 0 picks an ephemeral port.
    pub port: u16,
    /// Line sent to each peer right after it registers. `None` sends nothing.
    pub welcome: Option<String>,
    /// Longest inbound line accepted, not counting the newline.
    pub max_line_bytes: usize,
    /// Upper bound on a single write to one peer during fan-out.
    pub send_timeout: Duration,
    /// How long shutdown waits for connection tasks before aborting them.
    pub shutdown_grace: Duration,
    /// Consecutive non-transient accept failures tolerated before the
    /// accept loop gives up.
    pub max_accept_failures: u32,
}

impl RelayConfig {
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            welcome: Some(DEFAULT_WELCOME.to_string()),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            send_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            max_accept_failures: 32,
        }
    }
}
