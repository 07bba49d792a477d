//! Runtime and transport configuration.
//!
//! A [`RuntimeConfig`] is usually loaded from JSON:
//!
//! ```json
//! {
//!   "nodeId": 1,
//!   "listen": "tcp://0.0.0.0:7001",
//!   "nodes": { "2": "tcp://10.0.0.2:7001" },
//!   "shutdownTimeoutMs": 10000,
//!   "connectTimeoutMs": 10000,
//!   "maxFrameSize": 16777216
//! }
//! ```

use crate::{net::endpoint::Endpoint, types::NodeId, Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path, time::Duration};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// The part of the configuration every client and server carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Upper bound for each task join while closing.
    pub shutdown_timeout: Duration,
    /// Upper bound for establishing an outgoing connection.
    pub connect_timeout: Duration,
    /// Largest inbound frame body accepted; a bigger length prefix is a
    /// protocol error that closes the connection.
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub node_id: NodeId,
    /// Endpoint the runtime serves on when started.
    pub listen: Option<String>,
    /// Where to dial each known node.
    pub nodes: BTreeMap<NodeId, String>,
    pub shutdown_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_frame_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            listen: None,
            nodes: BTreeMap::new(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl RuntimeConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Self::default()
        }
    }

    pub fn with_listen(mut self, uri: impl Into<String>) -> Self {
        self.listen = Some(uri.into());
        self
    }

    pub fn with_node(mut self, node: NodeId, uri: impl Into<String>) -> Self {
        self.nodes.insert(node, uri.into());
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Checks that every configured endpoint parses and that no limit is
    /// zero.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("shutdownTimeoutMs", self.shutdown_timeout_ms),
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("maxFrameSize", self.max_frame_size as u64),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{field} must be greater than zero")));
            }
        }
        if let Some(listen) = &self.listen {
            Endpoint::parse(listen)?;
        }
        for (node, uri) in &self.nodes {
            if *node == self.node_id {
                return Err(Error::Config(format!("node {node} lists itself as a peer")));
            }
            Endpoint::parse(uri)?;
        }
        Ok(())
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            max_frame_size: self.max_frame_size,
        }
    }

    pub fn node_uri(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(&node).map(String::as_str)
    }
}
