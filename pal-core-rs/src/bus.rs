//! Message bus: one publish socket, many per-peer subscriptions
//!
//! A single polling task owns every subscription socket. Each iteration it
//! first applies pending membership changes and finished connect attempts,
//! then waits (bounded by the poll interval) for any socket to become
//! readable and reads one frame per ready socket. Connects run in their own
//! tasks and hand the socket back to the loop, so a slow peer never delays
//! the others. Sockets are only ever added or dropped between waits, so no
//! socket is closed while the loop is blocked on it.

use crate::config::MeshConfig;
use crate::error::Result;
use crate::queue::EventQueue;
use crate::transport::{Publisher, Subscription};
use crate::types::{BusEvent, PeerEndpoint, PeerEvent, PeerId};
use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fire-and-forget broadcast to all current subscribers
pub trait Publish: Send + Sync {
    /// Returns the number of subscribers the payload was queued for
    fn publish(&self, payload: Vec<u8>) -> usize;
}

/// Roster entry for a subscribed peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub endpoint: PeerEndpoint,
    /// False after a read error until the peer is rediscovered
    pub reachable: bool,
}

/// Peers whose subscription socket is open and polled
#[derive(Debug, Default)]
pub struct Roster {
    peers: HashMap<PeerId, RosterEntry>,
}

impl Roster {
    pub fn get(&self, id: &str) -> Option<&RosterEntry> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Peer ids in sorted order
    pub fn ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Broadcast bus multiplexing all peer subscriptions into one event queue
pub struct MessageBus {
    publisher: Publisher,
    membership: EventQueue<PeerEvent>,
    events: EventQueue<BusEvent>,
    roster: Arc<Mutex<Roster>>,
    shutdown: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    /// Bind the publish socket and start the polling loop.
    ///
    /// `membership` is drained by the loop; discovery feeds it and
    /// `add_peer`/`remove_peer` push onto it.
    pub async fn start(config: &MeshConfig, membership: EventQueue<PeerEvent>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let publisher = Publisher::bind(
            SocketAddr::new(config.bind_ip, config.port),
            config.publish_backlog,
            config.max_frame_len,
            shutdown.clone(),
        )
        .await?;
        info!("Bus: Publishing on {}", publisher.local_addr());

        let events = EventQueue::new();
        let roster = Arc::new(Mutex::new(Roster::default()));

        let (connected_tx, connected_rx) = mpsc::unbounded_channel();
        let poller = PollLoop {
            node_id: config.node_id.clone(),
            membership: membership.clone(),
            events: events.clone(),
            roster: roster.clone(),
            subscriptions: StreamMap::new(),
            pending: HashMap::new(),
            connected_tx,
            connected_rx,
            poll_interval: config.poll_interval,
            connect_timeout: config.connect_timeout,
            max_frame_len: config.max_frame_len,
        };
        let handle = tokio::spawn(poller.run(shutdown.clone()));

        Ok(Self {
            publisher,
            membership,
            events,
            roster,
            shutdown,
            poller: Mutex::new(Some(handle)),
        })
    }

    /// Merged stream of peer and message events
    pub fn events(&self) -> EventQueue<BusEvent> {
        self.events.clone()
    }

    /// Subscribe to a peer (applied by the polling loop)
    pub fn add_peer(&self, id: impl Into<PeerId>, endpoint: PeerEndpoint) -> Result<()> {
        self.membership.put(PeerEvent::Joined {
            id: id.into(),
            endpoint,
            metadata: HashMap::new(),
        })?;
        Ok(())
    }

    /// Drop a peer's subscription (applied by the polling loop)
    pub fn remove_peer(&self, id: impl Into<PeerId>) -> Result<()> {
        self.membership.put(PeerEvent::Left { id: id.into() })?;
        Ok(())
    }

    /// Ids of the peers currently subscribed to
    pub fn peers(&self) -> Vec<PeerId> {
        self.roster.lock().ids()
    }

    /// Roster entry for one peer
    pub fn peer(&self, id: &str) -> Option<RosterEntry> {
        self.roster.lock().get(id).cloned()
    }

    /// Address of our publish socket
    pub fn local_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    /// Number of peers subscribed to our publish socket
    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }

    /// Ask the polling loop to stop without waiting for it
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Stop polling, close every socket and close the event queue
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.poller.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Bus: Polling loop ended abnormally: {}", e);
            }
            info!("Bus: Shut down");
        }
    }
}

impl MessageBus {
    /// Publish, failing if the frame exceeds `max_frame_len`
    pub fn try_publish(&self, payload: Vec<u8>) -> Result<usize> {
        let sent = self.publisher.publish(Bytes::from(payload))?;
        debug!("Bus: Published frame to {} subscribers", sent);
        Ok(sent)
    }
}

impl Publish for MessageBus {
    fn publish(&self, payload: Vec<u8>) -> usize {
        match self.try_publish(payload) {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Bus: Dropped frame: {}", e);
                0
            }
        }
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Finished connect attempt
struct Connected {
    id: PeerId,
    endpoint: PeerEndpoint,
    result: io::Result<Subscription>,
}

struct PollLoop {
    node_id: PeerId,
    membership: EventQueue<PeerEvent>,
    events: EventQueue<BusEvent>,
    roster: Arc<Mutex<Roster>>,
    subscriptions: StreamMap<PeerId, Subscription>,
    /// Connect attempts in flight
    pending: HashMap<PeerId, PeerEndpoint>,
    connected_tx: mpsc::UnboundedSender<Connected>,
    connected_rx: mpsc::UnboundedReceiver<Connected>,
    poll_interval: Duration,
    connect_timeout: Duration,
    max_frame_len: usize,
}

impl PollLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        debug!("Bus: Polling loop started");
        while !shutdown.is_cancelled() {
            self.apply_membership();
            self.apply_connections();

            if self.subscriptions.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            let ready = tokio::select! {
                _ = shutdown.cancelled() => break,
                ready = tokio::time::timeout(self.poll_interval, self.subscriptions.next()) => ready,
            };

            if let Ok(Some((peer, item))) = ready {
                self.handle_item(peer, item);
                // One more frame from each further socket that is already readable
                for _ in 1..self.subscriptions.len() {
                    match self.subscriptions.next().now_or_never() {
                        Some(Some((peer, item))) => self.handle_item(peer, item),
                        _ => break,
                    }
                }
            }
        }
        self.close_all();
    }

    fn apply_membership(&mut self) {
        while let Some(event) = self.membership.try_get() {
            match event {
                PeerEvent::Joined { id, endpoint, .. } => self.subscribe(id, endpoint),
                PeerEvent::Left { id } => self.unsubscribe(&id),
            }
        }
    }

    /// Start connecting to a peer unless it is already reachable there
    fn subscribe(&mut self, id: PeerId, endpoint: PeerEndpoint) {
        if id == self.node_id {
            debug!("Bus: Ignoring subscription to ourselves");
            return;
        }

        let current = self.roster.lock().get(&id).cloned();
        if let Some(entry) = current {
            if entry.endpoint == endpoint && entry.reachable {
                debug!("Bus: Already subscribed to {} at {}", id, endpoint);
                return;
            }
        }
        if self.pending.get(&id) == Some(&endpoint) {
            debug!("Bus: Already connecting to {} at {}", id, endpoint);
            return;
        }

        self.pending.insert(id.clone(), endpoint);
        let connected = self.connected_tx.clone();
        let max_frame_len = self.max_frame_len;
        let timeout = self.connect_timeout;
        tokio::spawn(async move {
            let result = Subscription::connect(endpoint, max_frame_len, timeout).await;
            // The loop has stopped if nobody receives this
            let _ = connected.send(Connected { id, endpoint, result });
        });
    }

    /// Adopt sockets whose connect finished since the last iteration
    fn apply_connections(&mut self) {
        while let Ok(Connected { id, endpoint, result }) = self.connected_rx.try_recv() {
            if self.pending.get(&id) != Some(&endpoint) {
                debug!("Bus: Discarding superseded connect to \"{}\" at {}", id, endpoint);
                continue;
            }
            self.pending.remove(&id);

            match result {
                Ok(subscription) => {
                    // Replacing drops (and closes) the previous socket
                    self.subscriptions.insert(id.clone(), subscription);
                    let previous = self.roster.lock().peers.insert(
                        id.clone(),
                        RosterEntry {
                            endpoint,
                            reachable: true,
                        },
                    );

                    if previous.is_none() {
                        info!("Bus: Subscribed to \"{}\" at {}", id, endpoint);
                        self.emit(BusEvent::PeerAdded(id));
                    } else {
                        info!("Bus: Resubscribed to \"{}\" at {}", id, endpoint);
                    }
                }
                Err(e) => warn!("Bus: Could not subscribe to \"{}\" at {}: {}", id, endpoint, e),
            }
        }
    }

    fn unsubscribe(&mut self, id: &str) {
        let was_pending = self.pending.remove(id).is_some();
        let socket = self.subscriptions.remove(id);
        let entry = self.roster.lock().peers.remove(id);

        match (socket, entry) {
            (Some(socket), Some(_)) => {
                info!("Bus: Dropped subscription to \"{}\" at {}", id, socket.endpoint());
                drop(socket);
                self.emit(BusEvent::PeerRemoved(id.to_string()));
            }
            _ if was_pending => debug!("Bus: Abandoned connect to \"{}\"", id),
            _ => debug!("Bus: Removal of unknown peer \"{}\" ignored", id),
        }
    }

    fn emit(&self, event: BusEvent) {
        if self.events.put(event).is_err() {
            debug!("Bus: Event queue closed, event dropped");
        }
    }

    fn handle_item(&mut self, peer: PeerId, item: Result<BytesMut, io::Error>) {
        match item {
            Ok(frame) => {
                debug!("Bus: Received {} bytes from {}", frame.len(), peer);
                self.emit(BusEvent::MessageArrived {
                    peer,
                    payload: frame.to_vec(),
                });
            }
            Err(e) => {
                // The peer stays subscribed until discovery says it left
                warn!("Bus: Lost connection to \"{}\": {}", peer, e);
                if let Some(entry) = self.roster.lock().peers.get_mut(&peer) {
                    entry.reachable = false;
                }
            }
        }
    }

    fn close_all(&mut self) {
        let ids: Vec<PeerId> = self.subscriptions.keys().cloned().collect();
        for id in &ids {
            self.subscriptions.remove(id);
        }
        self.roster.lock().peers.clear();
        self.pending.clear();
        self.events.close();
        debug!("Bus: Polling loop stopped, closed {} subscriptions", ids.len());
    }
}
