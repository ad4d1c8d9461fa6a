//! AMQP session orchestration.
//!
//! A [`Session`] connects to the server, declares an exchange and a queue, binds them and
//! hands back a [`ChannelHandle`] to consume, publish and close. What happens meanwhile is
//! reported as [`SessionEvent`]s to the attached [`EventHandler`]s.
//!
//! The wire protocol is delegated to a protocol engine, see the [`engine`] module. The
//! default engine is built on lapin.

mod dev;
pub use dev::setup_logger;

mod channel_api;
pub use channel_api::ChannelHandle;

mod client_api;
pub use client_api::Session;

pub mod config;
pub use config::{parse_config, SessionConfig};

pub mod engine;

pub mod error;
pub use error::ClientError;

mod event;
pub use event::{EventHandler, SessionEvent};

mod message;
pub use message::{DeliveredMessage, ReturnedMessage};

mod model;
pub use model::{
    ChannelError, ChannelNumber, ConnectionError, ConnectionParameters, Topology, DEFAULT_EXCHANGE_NAME,
    DEFAULT_EXCHANGE_TYPE, DEFAULT_HOST, DEFAULT_LOGIN, DEFAULT_PASSWORD, DEFAULT_PORT, DEFAULT_QUEUE_NAME,
    DEFAULT_SPECIFICATION, SESSION_CHANNEL,
};

mod processor;

mod state;
pub use state::Phase;
