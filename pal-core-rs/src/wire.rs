//! Wire format for bus frames
//!
//! Every frame is one JSON record tagged by `type`, so peers built from
//! different versions can still tell chat traffic from state changes.

use crate::types::{unix_timestamp_micros, PeerId};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};

/// One unit of replicated application state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Position in the replicated log
    pub seqno: u64,
    /// Creation time (unix microseconds) on the origin node
    pub timestamp: u64,
    /// Node that created the entry
    pub origin_node: PeerId,
    /// Hex string on the wire
    #[serde(with = "hex")]
    pub payload: Vec<u8>,
}

impl StateEntry {
    pub fn new(seqno: u64, timestamp: u64, origin_node: impl Into<PeerId>, payload: Vec<u8>) -> Self {
        Self {
            seqno,
            timestamp,
            origin_node: origin_node.into(),
            payload,
        }
    }

    /// Tie-break rank: older first, then longer payload first
    pub fn rank(&self) -> (u64, Reverse<usize>) {
        (self.timestamp, Reverse(self.payload.len()))
    }

    /// Total order between candidates for the same seqno.
    ///
    /// Rank decides; origin and payload only separate distinct entries of
    /// equal rank so that every node picks the same winner.
    pub fn precedence(&self, other: &StateEntry) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.origin_node.cmp(&other.origin_node))
            .then_with(|| self.payload.cmp(&other.payload))
    }

    /// True if `self` strictly wins against `other`
    pub fn precedes(&self, other: &StateEntry) -> bool {
        self.precedence(other) == Ordering::Less
    }
}

/// Reconciliation message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StateEvent {
    /// Nothing actionable
    Noop,
    /// Asserts (with entry) or asks about (without entry) a seqno
    Verify,
}

/// State change exchanged between replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub seqno: u64,
    pub timestamp: u64,
    pub event: StateEvent,
    #[serde(default)]
    pub entry: Option<StateEntry>,
}

impl StateChange {
    /// VERIFY asserting `entry` for its seqno
    pub fn verify(entry: StateEntry) -> Self {
        Self {
            seqno: entry.seqno,
            timestamp: entry.timestamp,
            event: StateEvent::Verify,
            entry: Some(entry),
        }
    }

    /// VERIFY without an entry for `seqno`
    pub fn empty_verify(seqno: u64) -> Self {
        Self {
            seqno,
            timestamp: unix_timestamp_micros(),
            event: StateEvent::Verify,
            entry: None,
        }
    }

    /// NOOP reply to this change
    pub fn to_noop(&self) -> Self {
        Self {
            seqno: self.seqno,
            timestamp: self.timestamp,
            event: StateEvent::Noop,
            entry: None,
        }
    }

    /// Empty VERIFY acknowledging this change
    pub fn to_ack(&self) -> Self {
        Self {
            seqno: self.seqno,
            timestamp: self.timestamp,
            event: StateEvent::Verify,
            entry: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.event == StateEvent::Noop
    }

    /// VERIFY that carries no entry
    pub fn is_empty_verify(&self) -> bool {
        self.event == StateEvent::Verify && self.entry.is_none()
    }
}

/// Chat line sent to everyone or to one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: PeerId,
    #[serde(default)]
    pub to: Option<PeerId>,
    pub content: String,
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(author: impl Into<PeerId>, to: Option<PeerId>, content: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            to,
            content: content.into(),
            timestamp: unix_timestamp_micros(),
        }
    }

    /// True if addressed to every peer
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// True if `node_id` should see this message
    pub fn is_for(&self, node_id: &str) -> bool {
        self.to.as_deref().map_or(true, |to| to == node_id)
    }
}

/// Frame carried on the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "CHAT")]
    Chat(ChatMessage),

    #[serde(rename = "STATE")]
    State(StateChange),
}

impl WireMessage {
    /// Serialize message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(timestamp: u64, origin: &str, payload: &str) -> StateEntry {
        StateEntry::new(3, timestamp, origin, payload.as_bytes().to_vec())
    }

    #[test]
    fn test_rank_prefers_older_entries() {
        let old = entry(50, "b", "x");
        let new = entry(100, "a", "a much longer payload");

        assert!(old.precedes(&new));
        assert!(!new.precedes(&old));
    }

    #[test]
    fn test_rank_prefers_longer_payload_on_equal_timestamp() {
        let short = entry(100, "a", "hi");
        let long = entry(100, "b", "hello");

        assert!(long.precedes(&short));
    }

    #[test]
    fn test_precedence_is_total_for_distinct_entries() {
        let a = entry(100, "a", "same");
        let b = entry(100, "b", "same");

        assert!(a.precedes(&b) ^ b.precedes(&a));
        assert!(!a.precedes(&a.clone()));
    }

    #[test]
    fn test_state_message_format() {
        let msg = WireMessage::State(StateChange::verify(entry(7, "alpha", "hi")));
        let json: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(json["type"], "STATE");
        assert_eq!(json["event"], "VERIFY");
        assert_eq!(json["seqno"], 3);
        assert_eq!(json["entry"]["origin_node"], "alpha");
        assert_eq!(json["entry"]["payload"], "6869");

        let parsed = WireMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_decodes_noop_without_entry_field() {
        let raw = br#"{"type":"STATE","seqno":4,"timestamp":10,"event":"NOOP"}"#;

        match WireMessage::from_bytes(raw).unwrap() {
            WireMessage::State(change) => {
                assert!(change.is_noop());
                assert_eq!(change.seqno, 4);
                assert!(change.entry.is_none());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_chat_addressing() {
        let everyone = ChatMessage::new("alpha", None, "hello all");
        let direct = ChatMessage::new("alpha", Some("beta".to_string()), "psst");

        assert!(everyone.is_broadcast());
        assert!(everyone.is_for("gamma"));
        assert!(direct.is_for("beta"));
        assert!(!direct.is_for("gamma"));

        let parsed = WireMessage::from_bytes(&WireMessage::Chat(direct.clone()).to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, WireMessage::Chat(direct));
    }

    #[test]
    fn test_rejects_unknown_type() {
        assert!(WireMessage::from_bytes(br#"{"type":"PICKLE","data":[]}"#).is_err());
        assert!(WireMessage::from_bytes(b"not json").is_err());
    }
}
