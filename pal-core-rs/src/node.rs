//! A complete mesh node
//!
//! Wires discovery, the message bus and the reconciliation engine together:
//!
//! ```text
//! PeerDirectory ──PeerEvent──▶ MessageBus ──BusEvent──▶ dispatcher thread
//!                                  ▲                      │        │
//!                                  │ publish              │        ▼
//!                          ReconciliationEngine ◀─STATE───┘   MeshEvent queue
//! ```
//!
//! The dispatcher decodes every frame: state changes go through the engine
//! (which publishes its reply), chat lines addressed to us are forwarded.

use crate::bus::{MessageBus, Publish};
use crate::config::MeshConfig;
use crate::discovery::PeerDirectory;
use crate::error::Result;
use crate::queue::EventQueue;
use crate::reconcile::ReconciliationEngine;
use crate::storage::LogStore;
use crate::types::{BusEvent, PeerEndpoint, PeerId};
use crate::wire::{ChatMessage, StateEntry, WireMessage};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// What a node reports to its consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
    MessageArrived { peer: PeerId, message: ChatMessage },
    /// A remote change was stored or replaced an entry in our log
    EntryApplied(StateEntry),
}

pub struct Node {
    config: MeshConfig,
    directory: Option<PeerDirectory>,
    bus: Arc<MessageBus>,
    engine: Arc<ReconciliationEngine>,
    store: Option<LogStore>,
    events: EventQueue<MeshEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Validate `config`, bring up the bus and start announcing
    pub async fn start(config: MeshConfig) -> Result<Self> {
        config.validate()?;
        info!("Node: Starting \"{}\"", config.node_id);

        let directory = if config.use_mdns {
            Some(PeerDirectory::new(config.service_type.clone())?)
        } else {
            None
        };
        let membership = directory
            .as_ref()
            .map(|d| d.events())
            .unwrap_or_default();

        let bus = Arc::new(MessageBus::start(&config, membership).await?);
        for (id, endpoint) in &config.static_peers {
            bus.add_peer(id.clone(), *endpoint)?;
        }

        let publisher: Arc<dyn Publish> = bus.clone();
        let engine = Arc::new(ReconciliationEngine::new(config.node_id.clone(), publisher));

        let store = config.state_file.as_ref().map(LogStore::new);
        if let Some(store) = &store {
            if let Some(log) = store.load()? {
                engine.restore(log);
            }
        }

        if let Some(directory) = &directory {
            let ip = config.advertise_ip.unwrap_or(config.bind_ip);
            let endpoint = SocketAddr::new(ip, bus.local_addr().port());
            directory
                .start(&config.node_id, endpoint, config.metadata.clone())
                .await?;
        }

        let events = EventQueue::new();
        let dispatcher = {
            let node_id = config.node_id.clone();
            let bus_events = bus.events();
            let engine = engine.clone();
            let events = events.clone();
            thread::Builder::new()
                .name(format!("pal-dispatch-{}", node_id))
                .spawn(move || dispatch(&node_id, &bus_events, &engine, &events))?
        };

        Ok(Self {
            config,
            directory,
            bus,
            engine,
            store,
            events,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.node_id
    }

    /// Address of our publish socket
    pub fn local_addr(&self) -> SocketAddr {
        self.bus.local_addr()
    }

    /// Append `payload` to the shared log; returns its seqno
    pub fn append(&self, payload: impl Into<Vec<u8>>) -> u64 {
        self.engine.append(payload.into())
    }

    /// Clear the local log
    pub fn reset(&self) {
        self.engine.reset();
    }

    /// Re-assert every local entry to current peers
    pub fn resync(&self) -> usize {
        self.engine.resync()
    }

    /// Broadcast a chat line, or address it to one peer with `to`.
    ///
    /// Returns the number of subscribers it was queued for; a line too
    /// long for one frame is an error.
    pub fn send_chat(&self, content: impl Into<String>, to: Option<PeerId>) -> Result<usize> {
        let message = ChatMessage::new(self.config.node_id.clone(), to, content);
        let bytes = WireMessage::Chat(message).to_bytes()?;
        self.bus.try_publish(bytes)
    }

    /// Subscribe to a peer without waiting for discovery
    pub fn add_peer(&self, id: impl Into<PeerId>, endpoint: PeerEndpoint) -> Result<()> {
        self.bus.add_peer(id, endpoint)
    }

    pub fn events(&self) -> EventQueue<MeshEvent> {
        self.events.clone()
    }

    /// Ids of the peers we are subscribed to
    pub fn peers(&self) -> Vec<PeerId> {
        self.bus.peers()
    }

    /// Local log in seqno order
    pub fn log_snapshot(&self) -> Vec<StateEntry> {
        self.engine.entries()
    }

    /// Write the local log to the state file, if one is configured
    pub fn save_state(&self) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&self.engine.snapshot()),
            None => Ok(()),
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Leave the mesh: withdraw the announcement, close every socket, stop
    /// the dispatcher and persist the log. Later calls only save again.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(directory) = &self.directory {
            directory.stop()?;
        }
        self.bus.shutdown().await;

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!("Node: Dispatcher thread panicked"),
                Err(e) => warn!("Node: Could not join dispatcher: {}", e),
            }
        }
        self.events.close();

        self.save_state()?;
        info!("Node: \"{}\" stopped", self.config.node_id);
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // The dispatcher holds the bus through the engine, so stop it explicitly
        self.bus.stop();
    }
}

/// Drain bus events until the bus closes its queue
fn dispatch(
    node_id: &str,
    bus_events: &EventQueue<BusEvent>,
    engine: &ReconciliationEngine,
    events: &EventQueue<MeshEvent>,
) {
    for event in bus_events.iter() {
        let forwarded = match event {
            BusEvent::PeerAdded(id) => Some(MeshEvent::PeerAdded(id)),
            BusEvent::PeerRemoved(id) => Some(MeshEvent::PeerRemoved(id)),
            BusEvent::MessageArrived { peer, payload } => match WireMessage::from_bytes(&payload) {
                Ok(WireMessage::State(change)) => match engine.on_message(&peer, change) {
                    Ok(outcome) => outcome.adopted.map(MeshEvent::EntryApplied),
                    // Already logged by the engine
                    Err(_) => None,
                },
                Ok(WireMessage::Chat(message)) if message.is_for(node_id) => {
                    Some(MeshEvent::MessageArrived { peer, message })
                }
                Ok(WireMessage::Chat(message)) => {
                    debug!("Node: Chat from {} addressed to {:?}, skipped", peer, message.to);
                    None
                }
                Err(e) => {
                    warn!("Node: Dropping undecodable frame from {}: {}", peer, e);
                    None
                }
            },
        };

        if let Some(event) = forwarded {
            if events.put(event).is_err() {
                break;
            }
        }
    }
    events.close();
    debug!("Node: Dispatcher stopped");
}
