//! Core types shared by the mesh components

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable identifier of a node, taken from its mDNS instance name
pub type PeerId = String;

/// Address of a peer's publish socket
pub type PeerEndpoint = SocketAddr;

/// Membership change produced by discovery (or injected by hand)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Joined {
        id: PeerId,
        endpoint: PeerEndpoint,
        metadata: HashMap<String, String>,
    },
    Left {
        id: PeerId,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerEvent::Joined { id, .. } => id,
            PeerEvent::Left { id } => id,
        }
    }
}

/// Event emitted by the message bus polling loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
    MessageArrived { peer: PeerId, payload: Vec<u8> },
}

/// Current Unix timestamp in microseconds
pub fn unix_timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_event_id() {
        let joined = PeerEvent::Joined {
            id: "alpha".to_string(),
            endpoint: "127.0.0.1:31337".parse().unwrap(),
            metadata: HashMap::new(),
        };
        let left = PeerEvent::Left { id: "beta".to_string() };

        assert_eq!(joined.peer_id(), "alpha");
        assert_eq!(left.peer_id(), "beta");
    }

    #[test]
    fn test_timestamp_is_recent() {
        // 2020-01-01 in microseconds
        assert!(unix_timestamp_micros() > 1_577_836_800_000_000);
    }
}
