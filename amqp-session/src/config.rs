use crate::model::{ConnectionParameters, Topology};
use anyhow::Result;
use serde_derive::Deserialize;
use std::time::Duration;

/// Session settings read from a TOML file.
///
/// ```toml
/// verbose = true
/// handshake_timeout_ms = 5000
///
/// [connection]
/// host = "localhost"
/// port = 5672
///
/// [topology]
/// queue_name = "orders"
/// exchange_type = "fanout"
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub connection: ConnectionParameters,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub verbose: bool,
    /// Protocol specification the engine loads, the default one if it is missing.
    pub specification: Option<String>,
    pub handshake_timeout_ms: Option<u64>,
}

impl SessionConfig {
    pub fn from_toml(text: &str) -> Result<SessionConfig> {
        Ok(toml::from_str(text)?)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

pub fn parse_config(path: &str) -> Result<SessionConfig> {
    let cfg = std::fs::read_to_string(path)?;

    SessionConfig::from_toml(&cfg)
}
