//! Configuration file handling
//!
//! Identities and tuning values may be kept in a JSON file so long-running
//! nodes do not need them on the command line. Every field is optional;
//! missing values fall back to the library defaults.

use anyhow::{ensure, Context, Result};
use nodemux_node::NodeConfig;
use nodemux_proto::{AppRoute, PubKey};
use nodemux_tunnel::config::MIN_MESSAGE_SIZE;
use nodemux_tunnel::TunnelConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Contents of the JSON configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// This node's identity (hex)
    pub node_key: Option<String>,
    /// Remote node's identity (hex)
    pub peer_node_key: Option<String>,
    /// Local application identity (hex)
    pub app_key: Option<String>,
    /// Remote application identity (hex)
    pub peer_app_key: Option<String>,

    pub dial_timeout_secs: Option<u64>,
    pub read_buffer_margin: Option<usize>,
    pub dial_backlog_bytes: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub max_message_size: Option<usize>,
    pub queue_capacity: Option<usize>,
}

impl FileConfig {
    /// Load the configuration from `path`
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Load `path` if given, defaults otherwise
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Identity tuple for the handshake; unset keys are all-zero
    pub fn route(&self) -> Result<AppRoute> {
        Ok(AppRoute::new(
            parse_key("node_key", self.node_key.as_deref())?,
            parse_key("peer_node_key", self.peer_node_key.as_deref())?,
            parse_key("app_key", self.app_key.as_deref())?,
            parse_key("peer_app_key", self.peer_app_key.as_deref())?,
        ))
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        let defaults = TunnelConfig::default();
        TunnelConfig {
            dial_timeout: self
                .dial_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.dial_timeout),
            read_buffer_margin: self
                .read_buffer_margin
                .unwrap_or(defaults.read_buffer_margin),
            dial_backlog_bytes: self
                .dial_backlog_bytes
                .unwrap_or(defaults.dial_backlog_bytes),
        }
    }

    /// Node connection settings; rejects a message limit too small to carry
    /// a frame
    pub fn node_config(&self) -> Result<NodeConfig> {
        let defaults = NodeConfig::default();
        let max_message_size = self.max_message_size.unwrap_or(defaults.max_message_size);
        ensure!(
            max_message_size >= MIN_MESSAGE_SIZE,
            "max_message_size must be at least {} bytes, got {}",
            MIN_MESSAGE_SIZE,
            max_message_size
        );

        Ok(NodeConfig {
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            max_message_size,
            connect_timeout: self
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
        })
    }
}

fn parse_key(field: &str, value: Option<&str>) -> Result<PubKey> {
    match value {
        Some(key) => key
            .parse::<PubKey>()
            .with_context(|| format!("Invalid {}", field)),
        None => Ok(PubKey::ZERO),
    }
}
