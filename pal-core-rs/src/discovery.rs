//! mDNS discovery for OfficePal nodes

use crate::error::Result;
use crate::queue::EventQueue;
use crate::types::{PeerEndpoint, PeerEvent, PeerId};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Protocol version announced in the TXT record
const PROTOCOL_VERSION: &str = "1";

/// How long `stop` waits for the goodbye packet to go out
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(1);

/// Presence announcement and peer enumeration over mDNS
pub struct PeerDirectory {
    service_type: String,
    daemon: ServiceDaemon,
    events: EventQueue<PeerEvent>,
    fullname: Mutex<Option<String>>,
    stopped: AtomicBool,
}

impl PeerDirectory {
    /// Create the mDNS daemon for the given service type
    pub fn new(service_type: impl Into<String>) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;

        Ok(Self {
            service_type: service_type.into(),
            daemon,
            events: EventQueue::new(),
            fullname: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Queue of `Joined`/`Left` notifications.
    ///
    /// Every handle shares the same queue; nothing is replayed.
    pub fn events(&self) -> EventQueue<PeerEvent> {
        self.events.clone()
    }

    /// Announce ourselves and start browsing for other nodes.
    ///
    /// An unspecified endpoint IP lets the daemon announce every interface address.
    pub async fn start(
        &self,
        self_id: &str,
        endpoint: PeerEndpoint,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let host = format!("{}.local.", self_id);

        let mut properties = metadata;
        properties.insert("version".to_string(), PROTOCOL_VERSION.to_string());

        let service_info = if endpoint.ip().is_unspecified() {
            ServiceInfo::new(&self.service_type, self_id, &host, (), endpoint.port(), properties)?
                .enable_addr_auto()
        } else {
            let ip = endpoint.ip().to_string();
            ServiceInfo::new(&self.service_type, self_id, &host, ip.as_str(), endpoint.port(), properties)?
        };

        let fullname = service_info.get_fullname().to_string();
        self.daemon.register(service_info)?;
        *self.fullname.lock() = Some(fullname);
        info!("mDNS: Announcing {} on {}", self_id, self.service_type);

        let receiver = self.daemon.browse(&self.service_type)?;
        let events = self.events.clone();
        let mut tracker = PeerTracker::new(self_id);

        tokio::spawn(async move {
            loop {
                match receiver.recv_async().await {
                    Ok(event) => {
                        for change in tracker.on_service_event(event) {
                            if events.put(change).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("mDNS: Browse ended: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Withdraw our presence and release the daemon. Later calls do nothing.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(fullname) = self.fullname.lock().take() {
            match self.daemon.unregister(&fullname) {
                Ok(status) => {
                    let _ = status.recv_timeout(UNREGISTER_TIMEOUT);
                }
                Err(e) => warn!("mDNS: Failed to unregister {}: {}", fullname, e),
            }
        }
        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!("mDNS: Stop browse: {}", e);
        }
        self.events.close();
        self.daemon.shutdown()?;
        info!("mDNS: Stopped");
        Ok(())
    }
}

impl Drop for PeerDirectory {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("mDNS: Shutdown on drop failed: {}", e);
        }
    }
}

/// Turns raw service events into peer membership changes
struct PeerTracker {
    self_id: PeerId,
    known: HashMap<PeerId, PeerEndpoint>,
}

impl PeerTracker {
    fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            known: HashMap::new(),
        }
    }

    fn on_service_event(&mut self, event: ServiceEvent) -> Vec<PeerEvent> {
        match event {
            ServiceEvent::ServiceResolved(info) => self.on_resolved(&info),
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let node_id = instance_name(&fullname);
                if self.known.remove(&node_id).is_some() {
                    info!("mDNS: Node \"{}\" left", node_id);
                    vec![PeerEvent::Left { id: node_id }]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_resolved(&mut self, info: &ServiceInfo) -> Vec<PeerEvent> {
        let node_id = instance_name(info.get_fullname());

        // Don't add ourselves
        if node_id.is_empty() || node_id == self.self_id {
            return Vec::new();
        }

        let known = self.known.get(&node_id).copied();
        let addr = match pick_address(info.get_addresses(), known.map(|e| e.ip())) {
            Some(addr) => addr,
            None => {
                warn!("mDNS: Node \"{}\" resolved without an address", node_id);
                return Vec::new();
            }
        };
        let endpoint = SocketAddr::new(addr, info.get_port());

        let metadata: HashMap<String, String> = info
            .get_properties()
            .iter()
            .map(|p| (p.key().to_string(), p.val_str().to_string()))
            .collect();

        // Every resolution is reported; the bus ignores peers it already reaches
        let mut changes = Vec::new();
        match known {
            Some(known) if known == endpoint => {
                debug!("mDNS: Node \"{}\" re-announced at {}", node_id, endpoint)
            }
            Some(known) => {
                info!("mDNS: Node \"{}\" moved from {} to {}", node_id, known, endpoint);
                changes.push(PeerEvent::Left { id: node_id.clone() });
            }
            None => info!("mDNS: Discovered \"{}\" at {}", node_id, endpoint),
        }

        self.known.insert(node_id.clone(), endpoint);
        changes.push(PeerEvent::Joined {
            id: node_id,
            endpoint,
            metadata,
        });
        changes
    }
}

/// Keep the current address while it is still advertised, else take the
/// lowest IPv4 address, else the lowest address
fn pick_address<'a>(
    addresses: impl IntoIterator<Item = &'a IpAddr>,
    current: Option<IpAddr>,
) -> Option<IpAddr> {
    let addresses: Vec<IpAddr> = addresses.into_iter().copied().collect();
    if let Some(current) = current {
        if addresses.contains(&current) {
            return Some(current);
        }
    }
    addresses
        .iter()
        .filter(|a| a.is_ipv4())
        .min()
        .or_else(|| addresses.iter().min())
        .copied()
}

/// First label of a service fullname, i.e. the node id
fn instance_name(fullname: &str) -> PeerId {
    fullname.split('.').next().unwrap_or("").to_string()
}
