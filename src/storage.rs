use std::collections::HashMap;
use std::net::SocketAddrV4;
use time::{Duration, SteadyTime};

use crate::id::NodeId;
use crate::PEER_EXPIRATION;

/// An announced reachable peer for some network/content ID.
#[derive(Clone, Debug)]
pub struct PeerEndPoint {
    pub addr: SocketAddrV4,
    added: SteadyTime,
}

/// Per-network-ID lists of announced peer endpoints with a fixed TTL.
///
/// Entries expire `PEER_EXPIRATION` seconds after their last announcement;
/// re-announcing an endpoint refreshes its timestamp instead of duplicating
/// it. Expired entries are dropped lazily on access and by the periodic
/// maintenance sweep.
pub struct PeerStore {
    peers: HashMap<NodeId, Vec<PeerEndPoint>>,
    ttl: Duration,
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerStore {
    /// Constructs a new, empty `PeerStore` with the standard TTL.
    pub fn new() -> Self {
        PeerStore {
            peers: HashMap::new(),
            ttl: Duration::seconds(PEER_EXPIRATION as i64),
        }
    }

    #[cfg(test)]
    fn with_ttl(ttl: Duration) -> Self {
        PeerStore {
            peers: HashMap::new(),
            ttl,
        }
    }

    /// Records that `addr` serves `id`, refreshing the timestamp if the
    /// endpoint was already announced.
    pub fn insert(&mut self, id: NodeId, addr: SocketAddrV4) {
        let entries = self.peers.entry(id).or_insert_with(Vec::new);
        match entries.iter().position(|entry| entry.addr == addr) {
            Some(position) => entries[position].added = SteadyTime::now(),
            None => {
                debug!("PeerStore: new peer {} for {:?}", addr, id);
                entries.push(PeerEndPoint {
                    addr,
                    added: SteadyTime::now(),
                });
            }
        }
    }

    /// Returns the live endpoints announced for `id`.
    pub fn get(&mut self, id: &NodeId) -> Vec<SocketAddrV4> {
        let cutoff = SteadyTime::now() - self.ttl;
        match self.peers.get(id) {
            Some(entries) => entries
                .iter()
                .filter(|entry| entry.added > cutoff)
                .map(|entry| entry.addr)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drops every endpoint past its TTL. Called by the maintenance timer.
    pub fn remove_expired(&mut self) {
        let cutoff = SteadyTime::now() - self.ttl;
        for entries in self.peers.values_mut() {
            entries.retain(|entry| {
                if entry.added > cutoff {
                    true
                } else {
                    info!("PeerStore: expired peer {}", entry.addr);
                    false
                }
            });
        }
        self.peers.retain(|_, entries| !entries.is_empty());
    }

    /// Returns the number of network IDs with at least one live endpoint.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
