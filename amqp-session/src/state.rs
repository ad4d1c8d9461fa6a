//! `state` module is the session state machine. It handles the requests coming from the
//! client api side and the acknowledgments and events coming from the protocol engine.
//!
//! The handshake is driven by the acknowledgments: every step is requested from the handler
//! of the previous step's acknowledgment, so the steps cannot overlap or change order.

use crate::dev::progress;
use crate::engine::{
    BasicConsumeArgs, BasicPublishArgs, EngineEvent, ExchangeDeclareArgs, Method, ProtocolEngine, QueueBindArgs,
    QueueDeclareArgs, QueueDeclareOkArgs,
};
use crate::error::ClientError;
use crate::event::SessionEvent;
use crate::message::ReturnedMessage;
use crate::model::{ChannelError, ConnectionError, ConnectionParameters, Topology, SESSION_CHANNEL};
use anyhow::Result;
use bytes::Bytes;
use log::{debug, error, warn};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::{broadcast, oneshot, watch};

/// Lifecycle of a session. It only moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    TransportConnecting,
    NegotiatingHandshake,
    ExchangeDeclaring,
    QueueDeclaring,
    QueueBinding,
    Ready,
    Closing,
    Closed,
}

pub(crate) type Response = oneshot::Sender<Result<()>>;

/// Where the in-flight publish is.
#[derive(Debug, PartialEq)]
enum PublishStage {
    /// `Basic.Publish` is sent, waiting for it to be accepted.
    Method,
    /// Content is sent, waiting for it to go out.
    Content,
}

struct Publish {
    body: Bytes,
    response: Response,
}

struct InFlight {
    publish: Publish,
    stage: PublishStage,
}

pub(crate) struct SessionState<E: ProtocolEngine> {
    engine: E,
    phase: watch::Sender<Phase>,
    queue_name: String,
    exchange_name: String,
    exchange_type: String,
    login: String,
    password: String,
    verbose: bool,
    /// Taken away when closing starts, nothing is emitted after that.
    events: Option<broadcast::Sender<SessionEvent>>,
    /// Notified when the handshake finishes or fails.
    connected: Option<Response>,
    /// Notified when the broker confirms the consumer.
    consume: Option<Response>,
    consuming: bool,
    consumer_tag: String,
    publishes: VecDeque<Publish>,
    in_flight: Option<InFlight>,
    closed: Option<Response>,
}

impl<E: ProtocolEngine> fmt::Debug for SessionState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionState {{ phase={:?}, queue={}, exchange={}, login={}, password=*** }}",
            self.phase(),
            &self.queue_name,
            &self.exchange_name,
            &self.login
        )
    }
}

impl<E: ProtocolEngine> SessionState<E> {
    pub(crate) fn new(
        engine: E,
        params: &ConnectionParameters,
        topology: &Topology,
        verbose: bool,
        events: broadcast::Sender<SessionEvent>,
        phase: watch::Sender<Phase>,
    ) -> Self {
        SessionState {
            engine,
            phase,
            queue_name: topology.queue_name().to_string(),
            exchange_name: topology.exchange_name().to_string(),
            exchange_type: topology.exchange_type().to_string(),
            login: params.login().to_string(),
            password: params.password().to_string(),
            verbose,
            events: Some(events),
            connected: None,
            consume: None,
            consuming: false,
            consumer_tag: format!("amqp-session-{}", rand::random::<u128>()),
            publishes: VecDeque::new(),
            in_flight: None,
            closed: None,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed
    }

    fn set_phase(&self, phase: Phase) {
        debug!("Session phase {:?} -> {:?}", self.phase(), phase);

        self.phase.send_replace(phase);
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // No handlers attached is not an error.
            let _ = events.send(event);
        }
    }

    /// Checks if the acknowledgment is expected in the current phase.
    fn expecting(&self, expected: Phase, ack: &str) -> bool {
        let phase = self.phase();

        if phase != expected {
            warn!("Unexpected {} in phase {:?}, ignoring", ack, phase);

            return false;
        }

        true
    }

    /// Starts the handshake by opening the communication. `connected` is notified when the
    /// queue is bound or when any step fails.
    pub(crate) fn start(&mut self, connected: Response) {
        self.connected = Some(connected);
        self.set_phase(Phase::NegotiatingHandshake);

        progress!(self.verbose, "Opening communication as {}", self.login);

        let result = self.engine.open_communication(&self.login, &self.password, true);
        self.handshake_step(result);
    }

    pub(crate) fn handle_event(&mut self, event: EngineEvent) {
        debug!("Engine event {:?}", event);

        match event {
            EngineEvent::CommunicationOpened => self.communication_opened(),
            EngineEvent::ExchangeDeclared => self.exchange_declared(),
            EngineEvent::QueueDeclared(args) => self.queue_declared(args),
            EngineEvent::QueueBound => self.queue_bound(),
            EngineEvent::ConsumeStarted { consumer_tag } => self.consume_started(consumer_tag),
            EngineEvent::Delivered(message) => {
                // The engine may deliver before the consume ok is processed.
                if self.consuming || self.consume.is_some() {
                    self.emit(SessionEvent::IncomingMessage(message));
                } else {
                    warn!("Delivery without consuming {:?}", message);
                }
            }
            EngineEvent::PublishAccepted => self.publish_accepted(),
            EngineEvent::ContentSent => self.content_sent(),
            EngineEvent::Returned(message) => self.returned(message),
            EngineEvent::CommunicationClosed => {
                if self.expecting(Phase::Closing, "communication close") {
                    self.finish_close(Ok(()));
                }
            }
            EngineEvent::Failed { method, message } => self.failed(method, message),
            EngineEvent::TransportError(message) => self.transport_error(message),
        }
    }

    fn communication_opened(&mut self) {
        if !self.expecting(Phase::NegotiatingHandshake, "communication open") {
            return;
        }

        self.set_phase(Phase::ExchangeDeclaring);

        progress!(
            self.verbose,
            "Declaring exchange {} of type {}",
            self.exchange_name,
            self.exchange_type
        );

        let args = ExchangeDeclareArgs::default()
            .exchange_name(&self.exchange_name)
            .exchange_type(&self.exchange_type)
            .passive(false)
            .durable(false)
            .auto_delete(false)
            .internal(false)
            .no_wait(false);

        let result = self.engine.exchange_declare(SESSION_CHANNEL, args);
        self.handshake_step(result);
    }

    fn exchange_declared(&mut self) {
        if !self.expecting(Phase::ExchangeDeclaring, "exchange declare ok") {
            return;
        }

        self.set_phase(Phase::QueueDeclaring);

        progress!(self.verbose, "Declaring queue {}", self.queue_name);

        let args = QueueDeclareArgs::default()
            .name(&self.queue_name)
            .passive(false)
            .durable(true)
            .exclusive(false)
            .auto_delete(false)
            .no_wait(false);

        let result = self.engine.queue_declare(SESSION_CHANNEL, args);
        self.handshake_step(result);
    }

    fn queue_declared(&mut self, args: QueueDeclareOkArgs) {
        if !self.expecting(Phase::QueueDeclaring, "queue declare ok") {
            return;
        }

        progress!(
            self.verbose,
            "Queue {} declared with {} messages and {} consumers",
            args.name,
            args.message_count,
            args.consumer_count
        );

        self.set_phase(Phase::QueueBinding);

        progress!(
            self.verbose,
            "Binding queue {} to exchange {}",
            self.queue_name,
            self.exchange_name
        );

        let args = QueueBindArgs::new(&self.queue_name, &self.exchange_name).no_wait(false);

        let result = self.engine.queue_bind(SESSION_CHANNEL, args);
        self.handshake_step(result);
    }

    fn queue_bound(&mut self) {
        if !self.expecting(Phase::QueueBinding, "queue bind ok") {
            return;
        }

        self.set_phase(Phase::Ready);

        progress!(self.verbose, "Session is ready on channel {}", SESSION_CHANNEL);

        self.emit(SessionEvent::Ready {
            channel: SESSION_CHANNEL,
        });

        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Ok(()));
        }
    }

    /// A handshake step which couldn't even be requested fails the handshake.
    fn handshake_step(&mut self, result: Result<()>) {
        if let Err(e) = result {
            error!("Handshake step failed {:?}", e);

            let err = ClientError::from_anyhow(&e, ConnectionError::ConnectionForced as u16);

            self.emit(SessionEvent::Error(err.clone()));
            notify(self.connected.take(), Err(err));
        }
    }

    /// Starts consuming the bound queue.
    pub(crate) fn deliver(&mut self, response: Response) {
        if self.phase() != Phase::Ready {
            return reject(response, "Deliver is possible only in a ready session");
        }
        if self.consuming || self.consume.is_some() {
            return reject(response, "Session is already consuming");
        }

        progress!(self.verbose, "Consuming queue {} as {}", self.queue_name, self.consumer_tag);

        let args = BasicConsumeArgs::default()
            .queue(&self.queue_name)
            .consumer_tag(&self.consumer_tag)
            .no_local(false)
            .no_ack(true)
            .exclusive(true)
            .no_wait(false);

        match self.engine.basic_consume(SESSION_CHANNEL, args) {
            Ok(()) => self.consume = Some(response),
            Err(e) => {
                let _ = response.send(Err(e));
            }
        }
    }

    fn consume_started(&mut self, consumer_tag: String) {
        match self.consume.take() {
            Some(response) => {
                progress!(self.verbose, "Consumer {} started", consumer_tag);

                self.consuming = true;
                let _ = response.send(Ok(()));
            }
            None => warn!("Unexpected consume ok for {}, ignoring", consumer_tag),
        }
    }

    /// Queues a publish, publishes go out one by one.
    pub(crate) fn publish(&mut self, body: Bytes, response: Response) {
        if self.phase() != Phase::Ready {
            return reject(response, "Publish is possible only in a ready session");
        }

        self.publishes.push_back(Publish { body, response });

        if self.in_flight.is_none() {
            self.next_publish();
        }
    }

    fn next_publish(&mut self) {
        while let Some(publish) = self.publishes.pop_front() {
            let args = BasicPublishArgs::new(&self.exchange_name)
                .mandatory(true)
                .immediate(false);

            match self.engine.basic_publish(SESSION_CHANNEL, args) {
                Ok(()) => {
                    self.in_flight = Some(InFlight {
                        publish,
                        stage: PublishStage::Method,
                    });

                    return;
                }
                Err(e) => {
                    let _ = publish.response.send(Err(e));
                }
            }
        }
    }

    fn publish_accepted(&mut self) {
        let body = match &mut self.in_flight {
            Some(in_flight) if in_flight.stage == PublishStage::Method => {
                in_flight.stage = PublishStage::Content;
                in_flight.publish.body.clone()
            }
            _ => {
                warn!("Unexpected basic publish ok, ignoring");
                return;
            }
        };

        if let Err(e) = self.engine.content(SESSION_CHANNEL, body) {
            if let Some(in_flight) = self.in_flight.take() {
                let _ = in_flight.publish.response.send(Err(e));
            }

            self.next_publish();
        }
    }

    fn content_sent(&mut self) {
        match self.in_flight.take() {
            Some(in_flight) if in_flight.stage == PublishStage::Content => {
                let Publish { body, response } = in_flight.publish;

                self.emit(SessionEvent::PublishedMessage(body));
                let _ = response.send(Ok(()));

                self.next_publish();
            }
            other => {
                self.in_flight = other;

                warn!("Unexpected content sent, ignoring");
            }
        }
    }

    fn returned(&self, message: ReturnedMessage) {
        warn!("{}", return_report(&message));
    }

    fn failed(&mut self, method: Method, message: String) {
        error!("Method {} failed {}", method, message);

        let err = ClientError {
            channel: Some(SESSION_CHANNEL),
            code: ChannelError::PreconditionFailed as u16,
            message: format!("{} failed: {}", method, message),
        };

        self.emit(SessionEvent::Error(err.clone()));

        match method {
            Method::OpenCommunication | Method::ExchangeDeclare | Method::QueueDeclare | Method::QueueBind => {
                notify(self.connected.take(), Err(err));
            }
            Method::BasicConsume => notify(self.consume.take(), Err(err)),
            Method::BasicPublish | Method::Content => {
                if let Some(in_flight) = self.in_flight.take() {
                    let _ = in_flight.publish.response.send(Err(anyhow::Error::new(err)));
                }

                self.next_publish();
            }
            Method::CloseCommunication => self.finish_close(Err(err)),
        }
    }

    fn transport_error(&mut self, message: String) {
        error!("Transport error {}", message);

        let err = ClientError {
            channel: None,
            code: ConnectionError::ConnectionForced as u16,
            message,
        };

        self.emit(SessionEvent::Error(err.clone()));
        self.drain_waiters(&err);

        if self.phase() == Phase::Closing {
            self.finish_close(Err(err));
        }
    }

    /// Fails every operation which waits for an acknowledgment.
    fn drain_waiters(&mut self, err: &ClientError) {
        notify(self.connected.take(), Err(err.clone()));
        notify(self.consume.take(), Err(err.clone()));

        if let Some(in_flight) = self.in_flight.take() {
            let _ = in_flight.publish.response.send(Err(anyhow::Error::new(err.clone())));
        }

        for publish in self.publishes.drain(..) {
            let _ = publish.response.send(Err(anyhow::Error::new(err.clone())));
        }
    }

    /// Suppresses the events and asks for closing the communication. The response is sent
    /// when the engine confirmed the close and the transport is released.
    pub(crate) fn close(&mut self, response: Response) {
        if matches!(self.phase(), Phase::Closing | Phase::Closed) {
            return reject(response, "Session is already closing");
        }

        progress!(self.verbose, "Closing session");

        self.events.take();
        self.closed = Some(response);
        self.drain_waiters(&ClientError {
            channel: Some(SESSION_CHANNEL),
            code: ConnectionError::ConnectionForced as u16,
            message: "Session is closing".to_string(),
        });
        self.set_phase(Phase::Closing);

        if let Err(e) = self.engine.close_communication() {
            error!("Cannot close communication {:?}", e);

            self.finish_close(Err(ClientError::from_anyhow(&e, ConnectionError::ConnectionForced as u16)));
        }
    }

    fn finish_close(&mut self, result: std::result::Result<(), ClientError>) {
        self.engine.remove_all_listeners();
        self.engine.terminate();
        self.set_phase(Phase::Closed);

        progress!(self.verbose, "Session is closed");

        notify(self.closed.take(), result);
    }

    /// Gives up the handshake, used when it doesn't finish in time.
    pub(crate) fn abort(&mut self, reason: &str) {
        error!("Aborting session {}", reason);

        let err = ClientError {
            channel: None,
            code: ConnectionError::ConnectionForced as u16,
            message: reason.to_string(),
        };

        self.emit(SessionEvent::Error(err.clone()));
        self.events.take();
        self.drain_waiters(&err);

        self.engine.remove_all_listeners();
        self.engine.terminate();
        self.set_phase(Phase::Closed);
    }
}

/// Describes a message the broker sent back with everything the broker told about it.
fn return_report(message: &ReturnedMessage) -> String {
    let reason = if message.reply_code == ChannelError::NoRoute as u16 {
        "no route"
    } else {
        "returned"
    };

    format!(
        "Message is {} code={} text={} exchange={} routing_key={}",
        reason, message.reply_code, message.reply_text, message.exchange, message.routing_key
    )
}

fn notify(waiter: Option<Response>, result: std::result::Result<(), ClientError>) {
    if let Some(tx) = waiter {
        let _ = tx.send(result.map_err(anyhow::Error::new));
    }
}

fn reject(response: Response, message: &str) {
    let err = ClientError {
        channel: Some(SESSION_CHANNEL),
        code: ConnectionError::CommandInvalid as u16,
        message: message.to_string(),
    };

    let _ = response.send(Err(anyhow::Error::new(err)));
}
