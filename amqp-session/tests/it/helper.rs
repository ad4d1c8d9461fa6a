//! In-memory protocol engine which records the method calls and acknowledges them on its own
//! unless it is told to hold some of them back.

use amqp_session::engine::*;
use amqp_session::{ClientError, ConnectionParameters, EventHandler, Session, SessionEvent, Topology};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Specification(String),
    Connect { host: String, port: u16 },
    Open { login: String, password: String, immediate: bool },
    ExchangeDeclare(ExchangeDeclareArgs),
    QueueDeclare(QueueDeclareArgs),
    QueueBind(QueueBindArgs),
    BasicConsume(BasicConsumeArgs),
    BasicPublish(BasicPublishArgs),
    Content(Bytes),
    Close,
    RemoveAllListeners,
    Terminate,
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::Specification(_) => "specification",
            Call::Connect { .. } => "connect",
            Call::Open { .. } => "open",
            Call::ExchangeDeclare(_) => "exchange_declare",
            Call::QueueDeclare(_) => "queue_declare",
            Call::QueueBind(_) => "queue_bind",
            Call::BasicConsume(_) => "basic_consume",
            Call::BasicPublish(_) => "basic_publish",
            Call::Content(_) => "content",
            Call::Close => "close",
            Call::RemoveAllListeners => "remove_all_listeners",
            Call::Terminate => "terminate",
        }
    }
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    sink: Option<EventSink>,
    held: Vec<&'static str>,
    fail_connect: bool,
    reject_specification: bool,
}

/// Shared view of the scripted engine, tests keep one to inspect and drive it.
#[derive(Clone, Default)]
pub struct Script {
    inner: Arc<Mutex<Inner>>,
}

#[allow(dead_code)]
impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Don't acknowledge the calls with this name.
    pub fn hold(self, call: &'static str) -> Self {
        self.inner.lock().unwrap().held.push(call);
        self
    }

    pub fn failing_connect(self) -> Self {
        self.inner.lock().unwrap().fail_connect = true;
        self
    }

    pub fn rejecting_specification(self) -> Self {
        self.inner.lock().unwrap().reject_specification = true;
        self
    }

    pub fn connector(&self) -> ScriptedConnector {
        ScriptedConnector { script: self.clone() }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.calls().iter().map(Call::name).collect()
    }

    pub fn has_listener(&self) -> bool {
        self.inner.lock().unwrap().sink.is_some()
    }

    /// Sends an event as if the engine reported it.
    pub fn inject(&self, event: EngineEvent) {
        if let Some(sink) = &self.inner.lock().unwrap().sink {
            let _ = sink.send(event);
        }
    }

    /// Records the call and acknowledges it if it is not held.
    fn record(&self, call: Call, ack: EngineEvent) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let held = inner.held.contains(&call.name());

        inner.calls.push(call);

        if !held {
            if let Some(sink) = &inner.sink {
                let _ = sink.send(ack);
            }
        }

        Ok(())
    }

    /// Waits until the call with the name is recorded.
    pub async fn wait_for(&self, call: &'static str) {
        self.wait_for_count(call, 1).await
    }

    pub fn count(&self, call: &'static str) -> usize {
        self.call_names().iter().filter(|name| **name == call).count()
    }

    /// Waits until the call with the name is recorded `count` times.
    pub async fn wait_for_count(&self, call: &'static str, count: usize) {
        for _ in 0..200 {
            if self.count(call) >= count {
                return;
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        panic!("{} is not called, calls: {:?}", call, self.call_names());
    }
}

pub struct ScriptedConnector {
    script: Script,
}

impl Connector for ScriptedConnector {
    type Engine = ScriptedEngine;

    fn select_specification(&mut self, name: &str) -> Result<()> {
        let mut inner = self.script.inner.lock().unwrap();

        inner.calls.push(Call::Specification(name.to_string()));

        if inner.reject_specification {
            return Err(anyhow!("Unknown protocol specification {}", name));
        }

        Ok(())
    }

    fn connect<'a>(
        &'a mut self,
        params: &'a ConnectionParameters,
        events: EventSink,
    ) -> BoxFuture<'a, Result<Self::Engine>> {
        Box::pin(async move {
            let mut inner = self.script.inner.lock().unwrap();

            inner.calls.push(Call::Connect {
                host: params.host().to_string(),
                port: params.port(),
            });

            if inner.fail_connect {
                return Err(anyhow!("Connection refused"));
            }

            inner.sink = Some(events);

            Ok(ScriptedEngine {
                script: self.script.clone(),
            })
        })
    }
}

pub struct ScriptedEngine {
    script: Script,
}

impl ProtocolEngine for ScriptedEngine {
    fn open_communication(&mut self, login: &str, password: &str, immediate: bool) -> Result<()> {
        let call = Call::Open {
            login: login.to_string(),
            password: password.to_string(),
            immediate,
        };

        self.script.record(call, EngineEvent::CommunicationOpened)
    }

    fn exchange_declare(&mut self, _channel: u16, args: ExchangeDeclareArgs) -> Result<()> {
        self.script.record(Call::ExchangeDeclare(args), EngineEvent::ExchangeDeclared)
    }

    fn queue_declare(&mut self, _channel: u16, args: QueueDeclareArgs) -> Result<()> {
        let ok = QueueDeclareOkArgs {
            name: args.name.clone(),
            message_count: 0,
            consumer_count: 0,
        };

        self.script.record(Call::QueueDeclare(args), EngineEvent::QueueDeclared(ok))
    }

    fn queue_bind(&mut self, _channel: u16, args: QueueBindArgs) -> Result<()> {
        self.script.record(Call::QueueBind(args), EngineEvent::QueueBound)
    }

    fn basic_consume(&mut self, _channel: u16, args: BasicConsumeArgs) -> Result<()> {
        let consumer_tag = args.consumer_tag.clone();

        self.script
            .record(Call::BasicConsume(args), EngineEvent::ConsumeStarted { consumer_tag })
    }

    fn basic_publish(&mut self, _channel: u16, args: BasicPublishArgs) -> Result<()> {
        self.script.record(Call::BasicPublish(args), EngineEvent::PublishAccepted)
    }

    fn content(&mut self, _channel: u16, body: Bytes) -> Result<()> {
        self.script.record(Call::Content(body), EngineEvent::ContentSent)
    }

    fn close_communication(&mut self) -> Result<()> {
        self.script.record(Call::Close, EngineEvent::CommunicationClosed)
    }

    fn remove_all_listeners(&mut self) {
        let mut inner = self.script.inner.lock().unwrap();

        inner.calls.push(Call::RemoveAllListeners);
        inner.sink = None;
    }

    fn terminate(&mut self) {
        self.script.inner.lock().unwrap().calls.push(Call::Terminate);
    }
}

#[allow(dead_code)]
pub fn session(script: &Script) -> Session<ScriptedConnector> {
    Session::with_connector(script.connector(), ConnectionParameters::default(), Topology::default())
}

#[allow(dead_code)]
pub async fn next_event(handler: &mut EventHandler) -> SessionEvent {
    handler
        .receive_event(Duration::from_secs(1))
        .await
        .expect("No event in time")
}

#[allow(dead_code)]
pub fn to_client_error<T: std::fmt::Debug>(result: Result<T>) -> ClientError {
    result.unwrap_err().downcast::<ClientError>().unwrap()
}
