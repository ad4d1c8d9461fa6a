//! Protocol engine backed by the `lapin` AMQP 0-9-1 client.
//!
//! lapin methods are async, the engine contract is fire-and-forget. So the engine is an actor:
//! a spawned task owns the lapin connection and the session channel and executes the commands
//! one after the other, reporting the outcome of each on the event sink.

use super::{
    BasicConsumeArgs, BasicConsumeFlags, BasicPublishArgs, Connector, EngineEvent, EventSink, ExchangeDeclareArgs,
    ExchangeDeclareFlags, FieldTable, Method, ProtocolEngine, QueueBindArgs, QueueDeclareArgs, QueueDeclareFlags,
    QueueDeclareOkArgs,
};
use crate::client_error;
use crate::message::{DeliveredMessage, ReturnedMessage};
use crate::model::{ChannelError, ChannelNumber, ConnectionError, ConnectionParameters};
use anyhow::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::PublisherConfirm;
use lapin::types::{AMQPValue, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use log::{debug, error, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

/// Protocol specifications lapin speaks.
const SUPPORTED_SPECIFICATION: &str = "amqp0-9-1";

/// The event sink shared by the actor and the tasks it spawns. Once it is removed nothing is
/// reported anymore.
#[derive(Clone, Default)]
struct Listener(Arc<Mutex<Option<EventSink>>>);

impl Listener {
    fn new(sink: EventSink) -> Self {
        Listener(Arc::new(Mutex::new(Some(sink))))
    }

    fn emit(&self, event: EngineEvent) {
        if let Ok(guard) = self.0.lock() {
            if let Some(sink) = guard.as_ref() {
                if sink.send(event).is_err() {
                    debug!("Event sink is closed");
                }
            }
        }
    }

    fn remove(&self) {
        if let Ok(mut guard) = self.0.lock() {
            guard.take();
        }
    }
}

type Tasks = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Keeps the handle for termination and forgets the tasks which are already done.
fn track(tasks: &Tasks, handle: JoinHandle<()>) {
    if let Ok(mut guard) = tasks.lock() {
        guard.retain(|task| !task.is_finished());
        guard.push(handle);
    }
}

#[derive(Debug)]
enum Command {
    OpenCommunication,
    ExchangeDeclare(ExchangeDeclareArgs),
    QueueDeclare(QueueDeclareArgs),
    QueueBind(QueueBindArgs),
    BasicConsume(BasicConsumeArgs),
    Publish(BasicPublishArgs, Bytes),
    CloseCommunication,
}

impl Command {
    fn method(&self) -> Method {
        match self {
            Command::OpenCommunication => Method::OpenCommunication,
            Command::ExchangeDeclare(_) => Method::ExchangeDeclare,
            Command::QueueDeclare(_) => Method::QueueDeclare,
            Command::QueueBind(_) => Method::QueueBind,
            Command::BasicConsume(_) => Method::BasicConsume,
            Command::Publish(..) => Method::Content,
            Command::CloseCommunication => Method::CloseCommunication,
        }
    }
}

/// Creates [`LapinEngine`]s.
#[derive(Debug, Default)]
pub struct LapinConnector {
    specification: Option<String>,
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for LapinConnector {
    type Engine = LapinEngine;

    fn select_specification(&mut self, name: &str) -> Result<()> {
        if !name.contains(SUPPORTED_SPECIFICATION) {
            return client_error!(
                None,
                ConnectionError::NotImplemented as u16,
                format!("Protocol specification {} is not supported", name)
            );
        }

        self.specification = Some(name.to_string());

        Ok(())
    }

    fn connect<'a>(
        &'a mut self,
        params: &'a ConnectionParameters,
        events: EventSink,
    ) -> BoxFuture<'a, Result<Self::Engine>> {
        Box::pin(async move {
            debug!("Connecting with {:?} speaking {:?}", params, self.specification);

            let uri = connection_uri(params)?;
            let connection = Connection::connect(uri.as_str(), ConnectionProperties::default()).await?;

            let listener = Listener::new(events);
            let on_error = listener.clone();

            connection.on_error(move |err| {
                error!("Transport error {:?}", err);

                on_error.emit(EngineEvent::TransportError(err.to_string()));
            });

            Ok(LapinEngine::start(connection, listener))
        })
    }
}

/// Builds the AMQP URI of the default virtual host, credentials percent-encoded.
fn connection_uri(params: &ConnectionParameters) -> Result<Url> {
    let mut url = Url::parse("amqp://localhost/%2f")?;

    let invalid = |what: &str| {
        client_error!(
            None,
            ConnectionError::CommandInvalid as u16,
            format!("Invalid {} in connection parameters", what)
        )
    };

    if url.set_host(Some(params.host())).is_err() {
        return invalid("host");
    }
    if url.set_port(Some(params.port())).is_err() {
        return invalid("port");
    }
    if url.set_username(params.login()).is_err() {
        return invalid("login");
    }
    if url.set_password(Some(params.password())).is_err() {
        return invalid("password");
    }

    Ok(url)
}

pub struct LapinEngine {
    commands: mpsc::UnboundedSender<Command>,
    listener: Listener,
    /// The actor and the consumer and publisher confirm tasks, aborted on terminate.
    tasks: Tasks,
    /// `Basic.Publish` waiting for its content.
    pending_publish: Option<BasicPublishArgs>,
}

impl LapinEngine {
    fn start(connection: Connection, listener: Listener) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let tasks = Tasks::default();

        let actor = tokio::spawn(run(connection, rx, listener.clone(), tasks.clone()));
        track(&tasks, actor);

        LapinEngine {
            commands,
            listener,
            tasks,
            pending_publish: None,
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        debug!("Engine command {:?}", command);

        if self.commands.send(command).is_err() {
            return client_error!(None, ConnectionError::ConnectionForced as u16, "Engine is terminated");
        }

        Ok(())
    }
}

impl ProtocolEngine for LapinEngine {
    fn open_communication(&mut self, _login: &str, _password: &str, _immediate: bool) -> Result<()> {
        // lapin authenticates with the URI credentials while connecting, this opens the channel.
        self.send(Command::OpenCommunication)
    }

    fn exchange_declare(&mut self, _channel: ChannelNumber, args: ExchangeDeclareArgs) -> Result<()> {
        self.send(Command::ExchangeDeclare(args))
    }

    fn queue_declare(&mut self, _channel: ChannelNumber, args: QueueDeclareArgs) -> Result<()> {
        self.send(Command::QueueDeclare(args))
    }

    fn queue_bind(&mut self, _channel: ChannelNumber, args: QueueBindArgs) -> Result<()> {
        self.send(Command::QueueBind(args))
    }

    fn basic_consume(&mut self, _channel: ChannelNumber, args: BasicConsumeArgs) -> Result<()> {
        self.send(Command::BasicConsume(args))
    }

    fn basic_publish(&mut self, channel: ChannelNumber, args: BasicPublishArgs) -> Result<()> {
        if self.pending_publish.is_some() {
            return client_error!(
                Some(channel),
                ConnectionError::CommandInvalid as u16,
                "Previous publish is still waiting for its content"
            );
        }

        // lapin sends the method and the content together, so the method is accepted locally.
        self.pending_publish = Some(args);
        self.listener.emit(EngineEvent::PublishAccepted);

        Ok(())
    }

    fn content(&mut self, channel: ChannelNumber, body: Bytes) -> Result<()> {
        match self.pending_publish.take() {
            Some(args) => self.send(Command::Publish(args, body)),
            None => client_error!(
                Some(channel),
                ConnectionError::CommandInvalid as u16,
                "Content without basic publish"
            ),
        }
    }

    fn close_communication(&mut self) -> Result<()> {
        self.send(Command::CloseCommunication)
    }

    fn remove_all_listeners(&mut self) {
        self.listener.remove();
    }

    fn terminate(&mut self) {
        if let Ok(mut guard) = self.tasks.lock() {
            for task in guard.drain(..) {
                task.abort();
            }
        }
    }
}

async fn run(connection: Connection, mut commands: mpsc::UnboundedReceiver<Command>, listener: Listener, tasks: Tasks) {
    let mut channel: Option<Channel> = None;

    while let Some(command) = commands.recv().await {
        let method = command.method();

        match execute(command, &connection, &mut channel, &listener, &tasks).await {
            Ok(Some(event)) => listener.emit(event),
            Ok(None) => (),
            Err(e) => {
                error!("Method {} failed {:?}", method, e);

                listener.emit(EngineEvent::Failed {
                    method,
                    message: e.to_string(),
                });
            }
        }
    }

    debug!("Engine command queue is closed");
}

async fn execute(
    command: Command,
    connection: &Connection,
    channel: &mut Option<Channel>,
    listener: &Listener,
    tasks: &Tasks,
) -> Result<Option<EngineEvent>> {
    match command {
        Command::OpenCommunication => {
            let ch = connection.create_channel().await?;

            // Publisher confirms carry the returned mandatory messages.
            ch.confirm_select(ConfirmSelectOptions::default()).await?;
            *channel = Some(ch);

            Ok(Some(EngineEvent::CommunicationOpened))
        }
        Command::ExchangeDeclare(args) => {
            let ch = session_channel(channel)?;
            let opts = ExchangeDeclareOptions {
                passive: args.flags.contains(ExchangeDeclareFlags::PASSIVE),
                durable: args.flags.contains(ExchangeDeclareFlags::DURABLE),
                auto_delete: args.flags.contains(ExchangeDeclareFlags::AUTO_DELETE),
                internal: args.flags.contains(ExchangeDeclareFlags::INTERNAL),
                nowait: args.flags.contains(ExchangeDeclareFlags::NO_WAIT),
            };

            ch.exchange_declare(
                &args.exchange_name,
                exchange_kind(&args.exchange_type),
                opts,
                field_table(args.args),
            )
            .await?;

            Ok(Some(EngineEvent::ExchangeDeclared))
        }
        Command::QueueDeclare(args) => {
            let ch = session_channel(channel)?;
            let opts = QueueDeclareOptions {
                passive: args.flags.contains(QueueDeclareFlags::PASSIVE),
                durable: args.flags.contains(QueueDeclareFlags::DURABLE),
                exclusive: args.flags.contains(QueueDeclareFlags::EXCLUSIVE),
                auto_delete: args.flags.contains(QueueDeclareFlags::AUTO_DELETE),
                nowait: args.flags.contains(QueueDeclareFlags::NO_WAIT),
            };

            let queue = ch.queue_declare(&args.name, opts, field_table(args.args)).await?;

            Ok(Some(EngineEvent::QueueDeclared(QueueDeclareOkArgs {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            })))
        }
        Command::QueueBind(args) => {
            let ch = session_channel(channel)?;
            ch.queue_bind(
                &args.queue_name,
                &args.exchange_name,
                args.routing_key.as_deref().unwrap_or_default(),
                QueueBindOptions { nowait: args.no_wait },
                field_table(args.args),
            )
            .await?;

            Ok(Some(EngineEvent::QueueBound))
        }
        Command::BasicConsume(args) => {
            let ch = session_channel(channel)?;
            let opts = BasicConsumeOptions {
                no_local: args.flags.contains(BasicConsumeFlags::NO_LOCAL),
                no_ack: args.flags.contains(BasicConsumeFlags::NO_ACK),
                exclusive: args.flags.contains(BasicConsumeFlags::EXCLUSIVE),
                nowait: args.flags.contains(BasicConsumeFlags::NO_WAIT),
            };

            let consumer = ch
                .basic_consume(&args.queue, &args.consumer_tag, opts, field_table(args.args))
                .await?;
            let consumer_tag = consumer.tag().to_string();

            // Consume ok has to reach the session before the first delivery.
            listener.emit(EngineEvent::ConsumeStarted { consumer_tag });
            track(tasks, tokio::spawn(consume(consumer, listener.clone())));

            Ok(None)
        }
        Command::Publish(args, body) => {
            let ch = session_channel(channel)?;
            let opts = BasicPublishOptions {
                mandatory: args.is_mandatory(),
                immediate: args.is_immediate(),
            };

            let confirm = ch
                .basic_publish(
                    &args.exchange_name,
                    args.routing_key.as_deref().unwrap_or_default(),
                    opts,
                    &body,
                    BasicProperties::default(),
                )
                .await?;

            track(tasks, tokio::spawn(wait_for_return(confirm, listener.clone())));

            Ok(Some(EngineEvent::ContentSent))
        }
        Command::CloseCommunication => {
            if let Some(ch) = channel.take() {
                ch.close(ChannelError::Success as u16, "Normal close").await?;
            }
            connection.close(ChannelError::Success as u16, "Normal close").await?;

            Ok(Some(EngineEvent::CommunicationClosed))
        }
    }
}

fn session_channel(channel: &Option<Channel>) -> Result<&Channel> {
    match channel {
        Some(ch) => Ok(ch),
        None => client_error!(
            None,
            ConnectionError::CommandInvalid as u16,
            "Communication is not opened"
        ),
    }
}

/// Forwards deliveries until the consumer is cancelled or the channel goes away.
async fn consume(mut consumer: Consumer, listener: Listener) {
    let consumer_tag = consumer.tag().to_string();

    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => listener.emit(EngineEvent::Delivered(DeliveredMessage {
                body: Bytes::from(delivery.data),
                consumer_tag: consumer_tag.clone(),
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
            })),
            Err(e) => {
                warn!("Consumer {} stopped {:?}", consumer_tag, e);
                break;
            }
        }
    }
}

async fn wait_for_return(confirm: PublisherConfirm, listener: Listener) {
    match confirm.await {
        Ok(confirmation) => {
            if let Some(returned) = confirmation.take_message() {
                listener.emit(EngineEvent::Returned(ReturnedMessage {
                    body: Bytes::from(returned.delivery.data),
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.to_string(),
                    exchange: returned.delivery.exchange.to_string(),
                    routing_key: returned.delivery.routing_key.to_string(),
                }));
            }
        }
        Err(e) => warn!("Publisher confirm failed {:?}", e),
    }
}

fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

fn field_table(args: Option<FieldTable>) -> lapin::types::FieldTable {
    let mut table = lapin::types::FieldTable::default();

    for (key, value) in args.unwrap_or_default() {
        table.insert(ShortString::from(key), AMQPValue::LongString(LongString::from(value)));
    }

    table
}
