//! Contract of the AMQP protocol engine the session is built on.
//!
//! The engine encodes methods and content to the wire and decodes what the server sends.
//! Method invocations return as soon as the request is handed over; the outcome arrives
//! later as an [`EngineEvent`] on the [`EventSink`] given to [`Connector::connect`].
//! The session never waits on an invocation directly, only on its acknowledgment event.

pub mod lapin;

use crate::message::{DeliveredMessage, ReturnedMessage};
use crate::model::{ChannelNumber, ConnectionParameters};
use anyhow::Result;
use bitflags::bitflags;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

/// Extra arguments of a declare, bind or consume method.
pub type FieldTable = HashMap<String, String>;

/// Channel on which the engine reports acknowledgments and server initiated events.
pub type EventSink = mpsc::UnboundedSender<EngineEvent>;

/// AMQP methods the session invokes on the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    OpenCommunication,
    ExchangeDeclare,
    QueueDeclare,
    QueueBind,
    BasicConsume,
    BasicPublish,
    Content,
    CloseCommunication,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::OpenCommunication => "connection.open",
            Method::ExchangeDeclare => "exchange.declare",
            Method::QueueDeclare => "queue.declare",
            Method::QueueBind => "queue.bind",
            Method::BasicConsume => "basic.consume",
            Method::BasicPublish => "basic.publish",
            Method::Content => "content",
            Method::CloseCommunication => "connection.close",
        };

        f.write_str(name)
    }
}

/// Everything the engine reports back to the session.
#[derive(Debug)]
pub enum EngineEvent {
    CommunicationOpened,
    ExchangeDeclared,
    QueueDeclared(QueueDeclareOkArgs),
    QueueBound,
    ConsumeStarted { consumer_tag: String },
    /// A `Basic.Deliver` together with its content.
    Delivered(DeliveredMessage),
    /// The `Basic.Publish` method is accepted, the content can follow.
    PublishAccepted,
    /// The content body of the last publish has been sent out.
    ContentSent,
    /// The server sent back a mandatory message it couldn't route.
    Returned(ReturnedMessage),
    CommunicationClosed,
    /// The server refused a method, the acknowledgment will never come.
    Failed { method: Method, message: String },
    /// The underlying socket failed.
    TransportError(String),
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ExchangeDeclareFlags: u8 {
        const PASSIVE = 0b00000001;
        const DURABLE = 0b00000010;
        const AUTO_DELETE = 0b00000100;
        const INTERNAL = 0b00001000;
        const NO_WAIT = 0b00010000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct QueueDeclareFlags: u8 {
        const PASSIVE = 0b00000001;
        const DURABLE = 0b00000010;
        const EXCLUSIVE = 0b00000100;
        const AUTO_DELETE = 0b00001000;
        const NO_WAIT = 0b00010000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BasicConsumeFlags: u8 {
        const NO_LOCAL = 0b00000001;
        const NO_ACK = 0b00000010;
        const EXCLUSIVE = 0b00000100;
        const NO_WAIT = 0b00001000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BasicPublishFlags: u8 {
        const MANDATORY = 0b00000001;
        const IMMEDIATE = 0b00000010;
    }
}

macro_rules! empty_default {
    ($($flags:ty),*) => {
        $(
            impl Default for $flags {
                fn default() -> Self {
                    Self::empty()
                }
            }
        )*
    };
}

empty_default!(ExchangeDeclareFlags, QueueDeclareFlags, BasicConsumeFlags, BasicPublishFlags);

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExchangeDeclareArgs {
    pub exchange_name: String,
    pub exchange_type: String,
    pub flags: ExchangeDeclareFlags,
    pub args: Option<FieldTable>,
}

impl ExchangeDeclareArgs {
    pub fn exchange_name(mut self, name: &str) -> Self {
        self.exchange_name = name.to_string();
        self
    }

    pub fn exchange_type(mut self, exchange_type: &str) -> Self {
        self.exchange_type = exchange_type.to_string();
        self
    }

    pub fn passive(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::PASSIVE, mode);
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::DURABLE, mode);
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::AUTO_DELETE, mode);
        self
    }

    pub fn internal(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::INTERNAL, mode);
        self
    }

    pub fn no_wait(mut self, mode: bool) -> Self {
        self.flags.set(ExchangeDeclareFlags::NO_WAIT, mode);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueDeclareArgs {
    pub name: String,
    pub flags: QueueDeclareFlags,
    pub args: Option<FieldTable>,
}

impl QueueDeclareArgs {
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn passive(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::PASSIVE, mode);
        self
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::DURABLE, mode);
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::EXCLUSIVE, mode);
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::AUTO_DELETE, mode);
        self
    }

    pub fn no_wait(mut self, mode: bool) -> Self {
        self.flags.set(QueueDeclareFlags::NO_WAIT, mode);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueDeclareOkArgs {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueBindArgs {
    pub queue_name: String,
    pub exchange_name: String,
    /// `None` binds without a routing key filter.
    pub routing_key: Option<String>,
    pub no_wait: bool,
    pub args: Option<FieldTable>,
}

impl QueueBindArgs {
    pub fn new(queue_name: &str, exchange_name: &str) -> Self {
        QueueBindArgs {
            queue_name: queue_name.to_string(),
            exchange_name: exchange_name.to_string(),
            ..Default::default()
        }
    }

    pub fn no_wait(mut self, mode: bool) -> Self {
        self.no_wait = mode;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BasicConsumeArgs {
    pub queue: String,
    pub consumer_tag: String,
    pub flags: BasicConsumeFlags,
    pub args: Option<FieldTable>,
}

impl BasicConsumeArgs {
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn consumer_tag(mut self, consumer_tag: &str) -> Self {
        self.consumer_tag = consumer_tag.to_string();
        self
    }

    pub fn no_local(mut self, mode: bool) -> Self {
        self.flags.set(BasicConsumeFlags::NO_LOCAL, mode);
        self
    }

    pub fn no_ack(mut self, mode: bool) -> Self {
        self.flags.set(BasicConsumeFlags::NO_ACK, mode);
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.flags.set(BasicConsumeFlags::EXCLUSIVE, mode);
        self
    }

    pub fn no_wait(mut self, mode: bool) -> Self {
        self.flags.set(BasicConsumeFlags::NO_WAIT, mode);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BasicPublishArgs {
    pub exchange_name: String,
    /// `None` publishes without a routing key.
    pub routing_key: Option<String>,
    pub flags: BasicPublishFlags,
}

impl BasicPublishArgs {
    pub fn new(exchange_name: &str) -> Self {
        BasicPublishArgs {
            exchange_name: exchange_name.to_string(),
            ..Default::default()
        }
    }

    /// Mandatory messages which cannot be routed are returned by the server instead of being
    /// dropped.
    pub fn mandatory(mut self, mode: bool) -> Self {
        self.flags.set(BasicPublishFlags::MANDATORY, mode);
        self
    }

    pub fn immediate(mut self, mode: bool) -> Self {
        self.flags.set(BasicPublishFlags::IMMEDIATE, mode);
        self
    }

    pub fn is_mandatory(&self) -> bool {
        self.flags.contains(BasicPublishFlags::MANDATORY)
    }

    pub fn is_immediate(&self) -> bool {
        self.flags.contains(BasicPublishFlags::IMMEDIATE)
    }
}

/// Method invocation handle over an initialized transport.
///
/// Implementations must not block: every call hands the request over and returns, the
/// acknowledgment is delivered as an [`EngineEvent`] later. An `Err` means the request
/// could not even be handed over.
pub trait ProtocolEngine: Send + 'static {
    /// Authenticate and open the session channel. With `immediate` the connection is usable
    /// right after the handshake, without a deferred start.
    fn open_communication(&mut self, login: &str, password: &str, immediate: bool) -> Result<()>;

    fn exchange_declare(&mut self, channel: ChannelNumber, args: ExchangeDeclareArgs) -> Result<()>;

    fn queue_declare(&mut self, channel: ChannelNumber, args: QueueDeclareArgs) -> Result<()>;

    fn queue_bind(&mut self, channel: ChannelNumber, args: QueueBindArgs) -> Result<()>;

    fn basic_consume(&mut self, channel: ChannelNumber, args: BasicConsumeArgs) -> Result<()>;

    fn basic_publish(&mut self, channel: ChannelNumber, args: BasicPublishArgs) -> Result<()>;

    /// Send the content body belonging to the last accepted `basic_publish`.
    fn content(&mut self, channel: ChannelNumber, body: Bytes) -> Result<()>;

    fn close_communication(&mut self) -> Result<()>;

    /// Stop reporting anything on the event sink, including transport errors and deliveries.
    fn remove_all_listeners(&mut self);

    /// Tear down the transport. It may still be closing when this returns.
    fn terminate(&mut self);
}

/// Selects the protocol and opens transports, producing engines.
pub trait Connector: Send {
    type Engine: ProtocolEngine;

    /// Load the protocol specification. Fails if the engine doesn't know it.
    fn select_specification(&mut self, name: &str) -> Result<()>;

    /// Open a transport to the server and initialize an engine over it. The engine reports
    /// its events to `events`.
    fn connect<'a>(
        &'a mut self,
        params: &'a ConnectionParameters,
        events: EventSink,
    ) -> BoxFuture<'a, Result<Self::Engine>>;
}
