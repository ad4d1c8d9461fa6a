use serde_derive::Deserialize;
use std::fmt;

/// AMQP channel number
pub type ChannelNumber = u16;

/// The only channel a session opens. There is no multiplexing.
pub const SESSION_CHANNEL: ChannelNumber = 1;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_LOGIN: &str = "guest";
pub const DEFAULT_PASSWORD: &str = "guest";

pub const DEFAULT_QUEUE_NAME: &str = "amqp-session-queue";
pub const DEFAULT_EXCHANGE_NAME: &str = "amqp-session-exchange";
pub const DEFAULT_EXCHANGE_TYPE: &str = "direct";

/// Name of the protocol specification the engine is asked to load.
pub const DEFAULT_SPECIFICATION: &str = "rabbitmq/full/amqp0-9-1.stripped.extended";

/// Error codes in connection scope.
#[derive(Debug)]
pub enum ConnectionError {
    /// The server forced to close the connection.
    ConnectionForced = 320,
    /// The client sent a frame which didn't fit in the normal order.
    CommandInvalid = 503,
    /// The client tried to use a not implemented funcionality.
    NotImplemented = 540,
}

/// Error codes in channel scope.
#[derive(Debug)]
pub enum ChannelError {
    /// Denotes successful execution like connection or channel closed.
    Success = 200,
    /// The mandatory message cannot be routed to queues.
    NoRoute = 312,
    /// The work on resource is refused mostly because of validation errors.
    PreconditionFailed = 406,
}

/// Transport level parameters of a session. Every field falls back to its own default,
/// an empty string or a zero port counts as missing.
#[derive(Clone, Default, Deserialize)]
pub struct ConnectionParameters {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub login: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionParameters {{ host={}, port={}, login={}, password=*** }}",
            self.host(),
            self.port(),
            self.login()
        )
    }
}

impl ConnectionParameters {
    pub fn host(&self) -> &str {
        non_empty(&self.host).unwrap_or(DEFAULT_HOST)
    }

    pub fn port(&self) -> u16 {
        match self.port {
            Some(port) if port != 0 => port,
            _ => DEFAULT_PORT,
        }
    }

    pub fn login(&self) -> &str {
        non_empty(&self.login).unwrap_or(DEFAULT_LOGIN)
    }

    pub fn password(&self) -> &str {
        non_empty(&self.password).unwrap_or(DEFAULT_PASSWORD)
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_credentials(mut self, login: &str, password: &str) -> Self {
        self.login = Some(login.to_string());
        self.password = Some(password.to_string());
        self
    }
}

fn default_exchange_follows_queue() -> bool {
    true
}

/// Names of the broker entities a session declares and binds.
#[derive(Clone, Debug, Deserialize)]
pub struct Topology {
    pub queue_name: Option<String>,
    pub exchange_name: Option<String>,
    pub exchange_type: Option<String>,
    /// When the exchange name is missing it is taken from the queue name. Turning this off
    /// makes a missing exchange name fall back to [`DEFAULT_EXCHANGE_NAME`].
    #[serde(default = "default_exchange_follows_queue")]
    pub exchange_follows_queue: bool,
}

impl Default for Topology {
    fn default() -> Self {
        Topology {
            queue_name: None,
            exchange_name: None,
            exchange_type: None,
            exchange_follows_queue: true,
        }
    }
}

impl Topology {
    pub fn new(queue_name: &str, exchange_name: &str, exchange_type: &str) -> Self {
        Topology {
            queue_name: Some(queue_name.to_string()),
            exchange_name: Some(exchange_name.to_string()),
            exchange_type: Some(exchange_type.to_string()),
            ..Default::default()
        }
    }

    pub fn queue_name(&self) -> &str {
        non_empty(&self.queue_name).unwrap_or(DEFAULT_QUEUE_NAME)
    }

    pub fn exchange_name(&self) -> &str {
        match non_empty(&self.exchange_name) {
            Some(name) => name,
            None if self.exchange_follows_queue => self.queue_name(),
            None => DEFAULT_EXCHANGE_NAME,
        }
    }

    pub fn exchange_type(&self) -> &str {
        non_empty(&self.exchange_type).unwrap_or(DEFAULT_EXCHANGE_TYPE)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
