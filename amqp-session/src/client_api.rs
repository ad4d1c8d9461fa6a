use crate::channel_api::ChannelHandle;
use crate::client_error;
use crate::config::SessionConfig;
use crate::dev::progress;
use crate::engine::lapin::LapinConnector;
use crate::engine::Connector;
use crate::error::ClientError;
use crate::event::{EventHandler, SessionEvent, EVENT_CAPACITY};
use crate::model::{ConnectionError, ConnectionParameters, Topology, DEFAULT_SPECIFICATION, SESSION_CHANNEL};
use crate::processor::{self, Param};
use crate::state::{Phase, SessionState};
use anyhow::Result;
use log::error;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Capacity of the request queue between the handle and the session task.
const REQUEST_CAPACITY: usize = 16;

/// A session to an AMQP server. It connects, declares the exchange and the queue, binds them
/// and gives back a [`ChannelHandle`] to consume and publish on.
///
/// ```no_run
/// use amqp_session::{ConnectionParameters, Session, Topology};
///
/// # async fn run() -> anyhow::Result<()> {
/// let mut session = Session::new(ConnectionParameters::default(), Topology::default());
/// let channel = session.start().await?;
///
/// channel.publish("Hello").await?;
/// channel.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Session<C: Connector = LapinConnector> {
    connector: C,
    params: ConnectionParameters,
    topology: Topology,
    verbose: bool,
    specification: String,
    handshake_timeout: Option<Duration>,
    events: broadcast::Sender<SessionEvent>,
    /// Moved to the session task on start.
    phase_tx: Option<watch::Sender<Phase>>,
    phase: watch::Receiver<Phase>,
}

impl Session {
    /// Creates a session over the lapin protocol engine.
    pub fn new(params: ConnectionParameters, topology: Topology) -> Self {
        Session::with_connector(LapinConnector::new(), params, topology)
    }

    pub fn from_config(config: SessionConfig) -> Self {
        let timeout = config.handshake_timeout();
        let mut session = Session::new(config.connection, config.topology);

        session.set_verbose(config.verbose);
        session.set_handshake_timeout(timeout);

        if let Some(specification) = config.specification {
            session.specification = specification;
        }

        session
    }
}

impl<C: Connector> Session<C> {
    pub fn with_connector(connector: C, params: ConnectionParameters, topology: Topology) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (phase_tx, phase) = watch::channel(Phase::Idle);

        Session {
            connector,
            params,
            topology,
            verbose: false,
            specification: DEFAULT_SPECIFICATION.to_string(),
            handshake_timeout: None,
            events,
            phase_tx: Some(phase_tx),
            phase,
        }
    }

    /// Log every step of the session on info level.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Give up the start if the handshake doesn't finish in time. By default it waits forever.
    pub fn set_handshake_timeout(&mut self, timeout: Option<Duration>) {
        self.handshake_timeout = timeout;
    }

    /// Attach an event handler. It receives the events emitted from now on.
    pub fn subscribe(&self) -> EventHandler {
        EventHandler::new(self.events.subscribe())
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Connects to the server and runs the handshake. When it finishes `ready` is emitted and
    /// the handle of the session channel is returned. A session can be started only once.
    pub async fn start(&mut self) -> Result<ChannelHandle> {
        let phase = match self.phase_tx.take() {
            Some(phase) => phase,
            None => {
                return client_error!(
                    None,
                    ConnectionError::CommandInvalid as u16,
                    "Session is already started"
                )
            }
        };

        progress!(self.verbose, "Loading protocol specification {}", self.specification);

        self.connector.select_specification(&self.specification)?;

        phase.send_replace(Phase::TransportConnecting);

        progress!(
            self.verbose,
            "Connecting to {}:{}",
            self.params.host(),
            self.params.port()
        );

        let (event_sink, engine_events) = mpsc::unbounded_channel();

        let engine = match self.connector.connect(&self.params, event_sink).await {
            Ok(engine) => engine,
            Err(e) => {
                error!("Connection error {:?}", e);

                let err = ClientError::from_anyhow(&e, ConnectionError::ConnectionForced as u16);
                let _ = self.events.send(SessionEvent::Error(err));

                return Err(e);
            }
        };

        let (connected_tx, connected_rx) = oneshot::channel();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CAPACITY);

        let mut state = SessionState::new(
            engine,
            &self.params,
            &self.topology,
            self.verbose,
            self.events.clone(),
            phase,
        );
        state.start(connected_tx);

        tokio::spawn(processor::session_loop(state, engine_events, requests_rx));

        let handshake = match self.handshake_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, connected_rx).await {
                Ok(result) => result,
                Err(_) => {
                    let reason = format!("Handshake is not finished in {:?}", timeout);

                    if let Err(e) = processor::call(&requests_tx, Param::Abort(reason.clone())).await {
                        error!("Cannot abort session {:?}", e);
                    }

                    return client_error!(None, ConnectionError::ConnectionForced as u16, reason);
                }
            },
            None => connected_rx.await,
        };

        match handshake {
            Ok(Ok(())) => Ok(ChannelHandle::new(
                SESSION_CHANNEL,
                requests_tx,
                self.events.clone(),
                self.phase.clone(),
                self.topology.queue_name(),
                self.topology.exchange_name(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => client_error!(None, 0, "Connection closed by peer"),
        }
    }
}
