use crate::error::ClientError;
use crate::message::DeliveredMessage;
use crate::model::ChannelNumber;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Capacity of the event broadcast. Slow handlers lose the oldest events beyond it.
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Events a session emits to the attached handlers.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// The handshake finished, the session channel is usable.
    Ready { channel: ChannelNumber },
    Error(ClientError),
    IncomingMessage(DeliveredMessage),
    /// The content of a publish has been sent out.
    PublishedMessage(Bytes),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Ready { .. } => "ready",
            SessionEvent::Error(_) => "error",
            SessionEvent::IncomingMessage(_) => "incoming.message",
            SessionEvent::PublishedMessage(_) => "published.message",
        }
    }
}

/// Receiving end of the session events. Only events emitted after the handler is created are
/// received.
pub struct EventHandler {
    rx: broadcast::Receiver<SessionEvent>,
}

impl EventHandler {
    pub(crate) fn new(rx: broadcast::Receiver<SessionEvent>) -> Self {
        EventHandler { rx }
    }

    /// Waits for the next event. Closing the session doesn't end the wait, `None` is returned
    /// only after the `Session` and its `ChannelHandle` are dropped and the session task has
    /// stopped.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Event handler lagged behind, {} events are lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the next event with a timeout.
    pub async fn receive_event(&mut self, timeout: Duration) -> Option<SessionEvent> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            event = self.recv() => event,
            _ = &mut sleep => None,
        }
    }

    /// Turns the handler into a `Stream` of events, lost events are skipped.
    pub fn into_stream(self) -> impl futures::Stream<Item = SessionEvent> {
        BroadcastStream::new(self.rx).filter_map(|event| event.ok())
    }
}
