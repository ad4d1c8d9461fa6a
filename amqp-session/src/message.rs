use bytes::Bytes;

/// A message delivered to the session consumer.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeliveredMessage {
    pub body: Bytes,
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// A mandatory message the server couldn't route and sent back to the client.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReturnedMessage {
    pub body: Bytes,
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

impl DeliveredMessage {
    /// The body as text if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}
