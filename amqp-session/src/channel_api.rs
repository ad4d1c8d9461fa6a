use crate::event::{EventHandler, SessionEvent};
use crate::model::ChannelNumber;
use crate::processor::{self, Param, RequestSink};
use crate::state::Phase;
use anyhow::Result;
use bytes::Bytes;
use std::fmt;
use tokio::sync::{broadcast, watch};

/// Handle of a ready session channel. It doesn't own the engine, it sends requests to the
/// session task.
pub struct ChannelHandle {
    channel: ChannelNumber,
    sink: RequestSink,
    events: broadcast::Sender<SessionEvent>,
    phase: watch::Receiver<Phase>,
    queue_name: String,
    exchange_name: String,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("channel", &self.channel)
            .field("queue_name", &self.queue_name)
            .field("exchange_name", &self.exchange_name)
            .finish()
    }
}

impl ChannelHandle {
    pub(crate) fn new(
        channel: ChannelNumber,
        sink: RequestSink,
        events: broadcast::Sender<SessionEvent>,
        phase: watch::Receiver<Phase>,
        queue_name: &str,
        exchange_name: &str,
    ) -> ChannelHandle {
        ChannelHandle {
            channel,
            sink,
            events,
            phase,
            queue_name: queue_name.to_string(),
            exchange_name: exchange_name.to_string(),
        }
    }

    pub fn channel(&self) -> ChannelNumber {
        self.channel
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> EventHandler {
        EventHandler::new(self.events.subscribe())
    }

    /// Starts consuming the queue. Returns when the server confirmed the consumer, the
    /// messages arrive as `incoming.message` events until the channel is closed.
    pub async fn deliver(&self) -> Result<()> {
        processor::call(&self.sink, Param::Deliver).await
    }

    /// Publishes the content to the exchange. Returns when the content is sent out, after the
    /// `published.message` event.
    pub async fn publish(&self, content: impl Into<Bytes>) -> Result<()> {
        processor::call(&self.sink, Param::Publish(content.into())).await
    }

    /// Closes the session. No events are emitted from this point, pending operations fail.
    /// Returns when the server confirmed the close and the transport is released.
    pub async fn close(self) -> Result<()> {
        processor::call(&self.sink, Param::Close).await
    }
}
