//! Configuration for a mesh node
//!
//! Covers identity, the publish socket, discovery and the polling loop.

use crate::types::{PeerEndpoint, PeerId};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// mDNS service type announced by every node
pub const DEFAULT_SERVICE_TYPE: &str = "_officepal._tcp.local.";

/// Default TCP port of the publish socket
pub const DEFAULT_PORT: u16 = 31337;

/// Smallest frame limit we accept; a state change with an empty payload is
/// already around this size once encoded.
const MIN_FRAME_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("node id must not be empty")]
    EmptyNodeId,

    #[error("node id {0:?} must not contain '.'")]
    InvalidNodeId(String),

    #[error("service type {0:?} must end with \".local.\"")]
    InvalidServiceType(String),

    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    #[error("max frame length {0} is below the minimum of 64 bytes")]
    FrameTooSmall(usize),

    #[error("publish backlog must be greater than zero")]
    ZeroBacklog,
}

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Node identity, also the mDNS instance name
    pub node_id: PeerId,

    /// TCP port of the publish socket (0 picks an ephemeral port)
    pub port: u16,

    /// Local address the publish socket binds to
    pub bind_ip: IpAddr,

    /// Address announced over mDNS; `None` lets the daemon pick interface addresses
    pub advertise_ip: Option<IpAddr>,

    /// mDNS service type
    pub service_type: String,

    /// Extra TXT properties announced with our presence
    pub metadata: HashMap<String, String>,

    /// Upper bound on one readiness wait of the polling loop
    pub poll_interval: Duration,

    /// Timeout when opening a subscription to a peer
    pub connect_timeout: Duration,

    /// Largest frame accepted or sent on the bus
    pub max_frame_len: usize,

    /// Frames buffered per subscriber before the oldest are dropped
    pub publish_backlog: usize,

    /// Whether to use mDNS for discovery
    pub use_mdns: bool,

    /// Peers subscribed to at startup regardless of discovery
    pub static_peers: Vec<(PeerId, PeerEndpoint)>,

    /// Snapshot file for the replica log
    pub state_file: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_id: "officepal".to_string(),
            port: DEFAULT_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: None,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            metadata: HashMap::new(),
            poll_interval: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            max_frame_len: 64 * 1024,
            publish_backlog: 256,
            use_mdns: true,
            static_peers: Vec::new(),
            state_file: None,
        }
    }
}

impl MeshConfig {
    /// Create config for the given node id
    pub fn new(node_id: impl Into<PeerId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set publish port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set bind address
    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Set the address announced over mDNS
    pub fn with_advertise_ip(mut self, ip: IpAddr) -> Self {
        self.advertise_ip = Some(ip);
        self
    }

    /// Use a different mDNS service type
    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }

    /// Add a TXT property to our announcement
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the polling loop interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the subscription connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum frame length
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Add static peer
    pub fn with_peer(mut self, id: impl Into<PeerId>, endpoint: PeerEndpoint) -> Self {
        self.static_peers.push((id.into(), endpoint));
        self
    }

    /// Persist the replica log to this file
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Disable mDNS discovery
    pub fn without_mdns(mut self) -> Self {
        self.use_mdns = false;
        self
    }

    /// Check the settings the mesh relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::EmptyNodeId);
        }
        // The id is the first label of the service fullname
        if self.node_id.contains('.') {
            return Err(ConfigError::InvalidNodeId(self.node_id.clone()));
        }
        if !self.service_type.ends_with(".local.") {
            return Err(ConfigError::InvalidServiceType(self.service_type.clone()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.max_frame_len < MIN_FRAME_LEN {
            return Err(ConfigError::FrameTooSmall(self.max_frame_len));
        }
        if self.publish_backlog == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        Ok(())
    }
}
