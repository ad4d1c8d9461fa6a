use crate::model;
use std::fmt;

/// Represents a connection or channel error. If `channel` is `None` it is a
/// connection error.
#[derive(Clone, Debug)]
pub struct ClientError {
    pub channel: Option<model::ChannelNumber>,
    pub code: u16,
    pub message: String,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientError")
            .field("channel", &self.channel)
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    /// Takes the `ClientError` out of an `anyhow::Error` or wraps the foreign error into one
    /// with the given code.
    pub fn from_anyhow(err: &anyhow::Error, code: u16) -> ClientError {
        match err.downcast_ref::<ClientError>() {
            Some(ce) => ce.clone(),
            None => ClientError {
                channel: None,
                code,
                message: err.to_string(),
            },
        }
    }
}

/// Shorthand for creating errors in async functions.
#[macro_export]
macro_rules! client_error {
    ($channel:expr, $code:expr, $message:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($crate::error::ClientError {
            channel: $channel,
            code: $code,
            message: ::std::string::String::from($message),
        }))
    };
}
