/// Configuration management
use crate::error::{ChatError, Result};
use crate::realtime::TransportKind;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_MAX_MESSAGE_LEN: usize = 1000;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Real-time server address for the streaming transport
    pub socket_addr: SocketAddr,

    /// Base URL of the REST backend (history, polling transport)
    pub http_base: String,

    /// Transport tried first; the other one is the fallback
    pub preferred_transport: TransportKind,

    /// Connection (and handshake) timeout
    pub connection_timeout: Duration,

    /// Total connection attempts before reporting an error
    pub max_connection_attempts: u32,

    /// Consecutive failures on the preferred transport before falling back
    pub fallback_after: u32,

    /// Delay between connection attempts
    pub retry_interval: Duration,

    /// Upper bound of random jitter added to `retry_interval`
    pub retry_jitter: Duration,

    /// Links that drop sooner than this count against the attempt budget
    pub stable_link_after: Duration,

    /// Messages per history page
    pub page_size: usize,

    /// Inactivity window that ends an outbound typing burst
    pub typing_quiet_period: Duration,

    /// Hard timeout for the peer typing indicator
    pub peer_typing_timeout: Duration,

    /// Maximum message body length in characters
    pub max_message_len: usize,

    /// Window the server may hold a long-poll open on the polling transport
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_addr: SocketAddr::from(([127, 0, 0, 1], 3001)),
            http_base: "http://127.0.0.1:3000/api".to_string(),
            preferred_transport: TransportKind::Stream,
            connection_timeout: Duration::from_secs(10),
            max_connection_attempts: 5,
            fallback_after: 2,
            retry_interval: Duration::from_secs(1),
            retry_jitter: Duration::from_millis(250),
            stable_link_after: Duration::from_secs(5),
            page_size: DEFAULT_PAGE_SIZE,
            typing_quiet_period: Duration::from_secs(1),
            peer_typing_timeout: Duration::from_secs(3),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            poll_timeout: Duration::from_secs(25),
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        if args.len() < 3 {
            return Err(usage_error(args));
        }

        let socket_addr = args[1].parse::<SocketAddr>().map_err(|_| {
            ChatError::Config(format!("Invalid socket address: {}", args[1]))
        })?;

        let mut config = Self {
            socket_addr,
            ..Default::default()
        };

        let mut i = 3;
        while i < args.len() {
            let value = |name: &str| {
                args.get(i + 1).ok_or_else(|| {
                    ChatError::Config(format!("{} requires an argument", name))
                })
            };
            match args[i].as_str() {
                "--http" => {
                    config.http_base = value("--http")?.trim_end_matches('/').to_string();
                    i += 2;
                }
                "--page-size" => {
                    config.page_size = parse_number(value("--page-size")?, "--page-size")?;
                    i += 2;
                }
                "--max-attempts" => {
                    config.max_connection_attempts =
                        parse_number(value("--max-attempts")?, "--max-attempts")?;
                    i += 2;
                }
                "--transport" => {
                    config.preferred_transport = value("--transport")?.parse()?;
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(base) = std::env::var("CHATLINK_HTTP") {
            config.http_base = base.trim_end_matches('/').to_string();
        }
        if let Some(size) = std::env::var("CHATLINK_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.page_size = size;
        }
        if let Ok(kind) = std::env::var("CHATLINK_TRANSPORT") {
            config.preferred_transport = kind.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the session components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(ChatError::Config("page size must be at least 1".to_string()));
        }
        if self.max_connection_attempts == 0 {
            return Err(ChatError::Config(
                "max connection attempts must be at least 1".to_string(),
            ));
        }
        if self.peer_typing_timeout <= self.typing_quiet_period {
            return Err(ChatError::Config(
                "peer typing timeout must exceed the typing quiet period".to_string(),
            ));
        }
        Ok(())
    }
}

fn usage_error(args: &[String]) -> ChatError {
    ChatError::Config(format!(
        "Usage: {} <socket_addr> <conversation_id> [--http <url>] [--page-size <n>] [--max-attempts <n>] [--transport stream|polling]",
        args.first().map(String::as_str).unwrap_or("chatlink")
    ))
}

fn parse_number<T: std::str::FromStr>(raw: &str, flag: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| ChatError::Config(format!("{} must be a valid number", flag)))
}
