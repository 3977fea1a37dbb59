pub mod contact;

use std::collections::{BinaryHeap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use self::contact::{ContactDistancePair, NodeContact};
use crate::error::DhtError;
use crate::id::NodeId;
use crate::protocol::{ContactInfo, DhtPacket, PacketDirection, RpcKind};
use crate::routing::RoutingTable;
use crate::storage::PeerStore;
use crate::transport::{Connection, ConnectionFactory};
use crate::{
    CONCURRENCY_PARAM, MAINTENANCE_INTERVAL, REPLICATION_PARAM, REQUEST_TIMEOUT, STREAM_TYPE_DHT,
};

/// Which flavor of iterative lookup is running.
#[derive(Clone, Copy, PartialEq, Eq)]
enum LookupKind {
    Nodes,
    Peers,
}

/// The outcome of an iterative lookup.
enum LookupResult {
    /// The closest contacts that responded, nearest first.
    Contacts(Vec<NodeContact>),
    /// `FIND_PEERS` terminates as soon as any responder returns peers.
    Peers(Vec<SocketAddrV4>),
}

/// The DHT orchestrator for one local node.
///
/// Owns the routing table and the local peer store, executes RPCs through an
/// injected connection factory, answers inbound queries, and runs the
/// periodic health/refresh maintenance. Cloning is cheap and clones share all
/// state, which is how RPC worker threads are spawned.
#[derive(Clone)]
pub struct DhtClient {
    local_id: NodeId,
    local_addr: SocketAddrV4,
    routing_table: Arc<Mutex<RoutingTable>>,
    peer_store: Arc<Mutex<PeerStore>>,
    transport: Arc<dyn ConnectionFactory>,
    is_active: Arc<AtomicBool>,
}

impl DhtClient {
    /// Constructs a client with a random node ID listening on `dht_port`.
    pub fn new(dht_port: u16, transport: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_id(NodeId::rand(), dht_port, transport)
    }

    /// Constructs a client with a fixed node ID.
    pub fn with_id(id: NodeId, dht_port: u16, transport: Arc<dyn ConnectionFactory>) -> Self {
        let local_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, dht_port);
        DhtClient {
            local_id: id,
            local_addr,
            routing_table: Arc::new(Mutex::new(RoutingTable::new(id, local_addr))),
            peer_store: Arc::new(Mutex::new(PeerStore::new())),
            transport,
            is_active: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Returns the number of known remote nodes.
    pub fn total_nodes(&self) -> usize {
        self.table().total_contacts()
    }

    /// Returns every known remote node, stale ones included.
    pub fn all_nodes(&self) -> Vec<NodeContact> {
        self.table().all_contacts(true)
    }

    /// Adds a bootstrap node by bare endpoint and pings it to resolve its ID.
    /// Adding the same endpoint twice leaves a single contact in the table.
    pub fn add_node(&self, addr: SocketAddrV4) {
        let stub = NodeContact::unresolved(addr);
        self.table().add_contact(stub.clone());
        self.query(&stub, self.request(RpcKind::Ping));
    }

    pub fn add_nodes(&self, addrs: &[SocketAddrV4]) {
        for addr in addrs {
            self.add_node(*addr);
        }
    }

    /// Looks up the peers announced for `network_id` anywhere in the network.
    pub fn find_peers(&self, network_id: &NodeId) -> Option<Vec<SocketAddrV4>> {
        match self.lookup(network_id, LookupKind::Peers) {
            LookupResult::Peers(peers) => Some(peers),
            LookupResult::Contacts(_) => None,
        }
    }

    /// Announces that this host serves `network_id` on `service_port` to the
    /// nodes closest to the ID. Returns the union of the peer lists reported
    /// by every responder within one timeout window, or `None` when no
    /// closest nodes could be determined.
    pub fn announce(&self, network_id: &NodeId, service_port: u16) -> Option<Vec<SocketAddrV4>> {
        let closest = match self.lookup(network_id, LookupKind::Nodes) {
            LookupResult::Contacts(contacts) if !contacts.is_empty() => contacts,
            _ => return None,
        };

        let (tx, rx) = channel();
        let mut outstanding = 0;
        for dest in closest {
            let node = self.clone();
            let tx = tx.clone();
            let target = *network_id;
            outstanding += 1;
            thread::spawn(move || {
                let request = node
                    .request(RpcKind::AnnouncePeer)
                    .with_target(target)
                    .with_service_port(service_port);
                if tx.send(node.query(&dest, request)).is_err() {
                    debug!("announce window closed before rpc returned");
                }
            });
        }

        // aggregate from every responder; intentionally no short circuit
        let deadline = Instant::now() + Duration::from_millis(REQUEST_TIMEOUT);
        let mut peers: Vec<SocketAddrV4> = Vec::new();
        while outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(Some(response)) => {
                    outstanding -= 1;
                    for peer in response.peers {
                        if !peers.contains(&peer) {
                            peers.push(peer);
                        }
                    }
                }
                Ok(None) => outstanding -= 1,
                Err(_) => break,
            }
        }
        Some(peers)
    }

    /// Answers queries arriving on one accepted stream until the remote
    /// closes it or sends a query that yields no response.
    pub fn accept_connection(
        &self,
        stream: &mut dyn Connection,
        remote_ip: Ipv4Addr,
    ) -> Result<(), DhtError> {
        stream.set_timeout(Some(Duration::from_millis(REQUEST_TIMEOUT)))?;
        loop {
            let mut discriminator = [0u8; 1];
            match stream.read_exact(&mut discriminator) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            if discriminator[0] != STREAM_TYPE_DHT {
                return Err(DhtError::UnexpectedStreamType(discriminator[0]));
            }

            let query = DhtPacket::read_from(&mut *stream, PacketDirection::Query)?;
            let response = match self.handle_query(query, remote_ip) {
                Some(response) => response,
                None => return Ok(()),
            };
            response.write_to(&mut *stream, PacketDirection::Response)?;
            stream.flush()?;
        }
    }

    /// Starts the periodic maintenance timer. Returns the timer thread's
    /// handle so the caller can join it after `stop`.
    pub fn start_maintenance(&self) -> thread::JoinHandle<()> {
        let node = self.clone();
        thread::spawn(move || {
            // sleep in one-second slices so stop() takes effect promptly
            let mut slept = 0;
            while node.is_active.load(Ordering::Acquire) {
                thread::sleep(Duration::from_secs(1));
                slept += 1;
                if slept < MAINTENANCE_INTERVAL {
                    continue;
                }
                slept = 0;
                node.run_maintenance_cycle();
            }
            info!("{} - maintenance stopped", node.local_addr);
        })
    }

    /// Stops the maintenance timer within a second.
    pub fn stop(&self) {
        self.is_active.store(false, Ordering::Release);
    }

    /// One full maintenance pass: expire announced peers, health-check stale
    /// contacts, refresh idle buckets, then look up the local ID to keep the
    /// neighborhood warm. All spawned work is joined before returning.
    pub fn run_maintenance_cycle(&self) {
        self.peers().remove_expired();
        self.check_contact_health();
        self.refresh_buckets();
        self.lookup(&self.local_id, LookupKind::Nodes);
    }

    /// Pings every stale contact and evicts those that stay unresponsive,
    /// subject to the routing table's no-shrink-below-k rule.
    fn check_contact_health(&self) {
        let stale = self.table().stale_contacts();
        let mut handles = Vec::new();
        for dest in stale {
            let node = self.clone();
            handles.push(thread::spawn(move || {
                if node.query(&dest, node.request(RpcKind::Ping)).is_none()
                    && node.table().remove_contact(&dest)
                {
                    info!("{} - evicted stale contact {:?}", node.local_addr, dest);
                }
            }));
        }
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Looks up a random ID inside every idle bucket's prefix, seeded from
    /// that bucket's own contacts, to repopulate it with fresh data.
    fn refresh_buckets(&self) {
        let targets = self.table().refresh_targets();
        let mut handles = Vec::new();
        for (target, seed) in targets {
            let node = self.clone();
            handles.push(thread::spawn(move || {
                node.lookup_with_seed(&target, LookupKind::Nodes, seed);
            }));
        }
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn request(&self, kind: RpcKind) -> DhtPacket {
        DhtPacket::new(self.local_id, self.local_addr.port(), kind)
    }

    fn table(&self) -> MutexGuard<'_, RoutingTable> {
        match self.routing_table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn peers(&self) -> MutexGuard<'_, PeerStore> {
        match self.peer_store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Sends one RPC: connect, write the stream discriminator and the query,
    /// read exactly one response. The routing table learns from the outcome
    /// either way; transport errors are never propagated to the caller.
    fn query(&self, dest: &NodeContact, request: DhtPacket) -> Option<DhtPacket> {
        debug!(
            "{} - sending {:?} to {:?}",
            self.local_addr, request.kind, dest
        );
        match self.exchange(dest, &request) {
            Ok(response) => {
                if let Some(expected) = dest.id {
                    if expected != response.source_id {
                        // the endpoint now answers under a different identity;
                        // demote the entry we believed in
                        warn!(
                            "{} - {} changed id from {:?} to {:?}",
                            self.local_addr, dest.addr, expected, response.source_id
                        );
                        self.table().record_failure(dest);
                    }
                }
                let addr = SocketAddrV4::new(*dest.addr.ip(), response.source_port);
                self.table().record_success(response.source_id, addr);
                Some(response)
            }
            Err(err) => {
                warn!("{} - rpc to {} failed: {}", self.local_addr, dest.addr, err);
                self.table().record_failure(dest);
                None
            }
        }
    }

    fn exchange(&self, dest: &NodeContact, request: &DhtPacket) -> Result<DhtPacket, DhtError> {
        let mut conn = self.transport.connect(dest.addr)?;
        conn.set_timeout(Some(Duration::from_millis(REQUEST_TIMEOUT)))?;
        conn.write_all(&[STREAM_TYPE_DHT])?;
        request.write_to(&mut *conn, PacketDirection::Query)?;
        conn.flush()?;

        let response = DhtPacket::read_from(&mut *conn, PacketDirection::Response)?;
        if response.kind != request.kind {
            return Err(DhtError::UnexpectedRpc {
                expected: request.kind,
                actual: response.kind,
            });
        }
        Ok(response)
    }

    /// Handles one inbound query. Returns `None` for queries that get no
    /// response (currently only self-queries, which are dropped outright).
    fn handle_query(&self, query: DhtPacket, remote_ip: Ipv4Addr) -> Option<DhtPacket> {
        if query.source_id == self.local_id {
            warn!("{} - dropping query claiming our own id", self.local_addr);
            return None;
        }
        let sender_addr = SocketAddrV4::new(remote_ip, query.source_port);
        self.table().record_success(query.source_id, sender_addr);
        info!(
            "{} - {:?} query from {}",
            self.local_addr, query.kind, sender_addr
        );

        let response = self.request(query.kind);
        match query.kind {
            RpcKind::Ping => Some(response),
            RpcKind::FindNode => {
                let target = query.target?;
                Some(
                    response
                        .with_target(target)
                        .with_contacts(self.closest_infos(&target)),
                )
            }
            RpcKind::FindPeers => {
                let target = query.target?;
                let peers = self.peers().get(&target);
                if peers.is_empty() {
                    Some(
                        response
                            .with_target(target)
                            .with_contacts(self.closest_infos(&target)),
                    )
                } else {
                    // peers found: the empty contact list stops the recursion
                    Some(response.with_target(target).with_peers(peers))
                }
            }
            RpcKind::AnnouncePeer => {
                let target = query.target?;
                let service_port = query.service_port?;
                let current = {
                    let mut peers = self.peers();
                    peers.insert(target, SocketAddrV4::new(remote_ip, service_port));
                    peers.get(&target)
                };
                Some(
                    response
                        .with_target(target)
                        .with_service_port(service_port)
                        .with_peers(current),
                )
            }
        }
    }

    fn closest_infos(&self, target: &NodeId) -> Vec<ContactInfo> {
        self.table()
            .closest_contacts(target, REPLICATION_PARAM)
            .iter()
            .filter_map(ContactInfo::from_contact)
            .collect()
    }

    fn lookup(&self, target: &NodeId, kind: LookupKind) -> LookupResult {
        let seed = self.table().closest_contacts(target, REPLICATION_PARAM);
        self.lookup_with_seed(target, kind, seed)
    }

    /// The iterative parallel lookup. Each round dispatches RPCs to the α
    /// closest unqueried contacts and blocks on the fan-in channel until the
    /// first reply that improves on the closest distance seen so far. A round
    /// with no improvement triggers one final widened round (α = k) before
    /// the lookup settles on the closest responders. Straggler replies from
    /// earlier rounds keep arriving on the same channel and still contribute.
    fn lookup_with_seed(
        &self,
        target: &NodeId,
        kind: LookupKind,
        seed: Vec<NodeContact>,
    ) -> LookupResult {
        let mut available: BinaryHeap<ContactDistancePair> = seed
            .iter()
            .map(|contact| ContactDistancePair::new(contact.clone(), target))
            .collect();
        let mut seen: HashSet<SocketAddrV4> = seed.iter().map(|contact| contact.addr).collect();
        let mut failed: HashSet<SocketAddrV4> = HashSet::new();
        let mut responded: Vec<NodeContact> = Vec::new();
        let mut closest_distance = available
            .peek()
            .map(|pair| pair.1)
            .unwrap_or_else(NodeId::max_value);

        let (tx, rx) = channel();
        let mut in_flight = 0usize;
        let mut alpha = CONCURRENCY_PARAM;
        let mut final_round = false;

        loop {
            let mut dispatched = 0;
            while dispatched < alpha {
                match available.pop() {
                    Some(ContactDistancePair(dest, _)) => {
                        self.spawn_lookup_rpc(dest, *target, kind, tx.clone());
                        in_flight += 1;
                        dispatched += 1;
                    }
                    None => break,
                }
            }
            if in_flight == 0 {
                break;
            }

            let deadline = Instant::now() + Duration::from_millis(REQUEST_TIMEOUT);
            let mut round_useful = false;
            'wait: while in_flight > 0 {
                let now = Instant::now();
                if now >= deadline {
                    break 'wait;
                }
                match rx.recv_timeout(deadline - now) {
                    Ok((dest, Some(response))) => {
                        in_flight -= 1;
                        let responder = NodeContact::new(
                            response.source_id,
                            SocketAddrV4::new(*dest.addr.ip(), response.source_port),
                        );
                        if !responded.iter().any(|known| *known == responder) {
                            responded.push(responder);
                        }

                        if kind == LookupKind::Peers && !response.peers.is_empty() {
                            return LookupResult::Peers(response.peers);
                        }

                        for info in &response.contacts {
                            if info.id == self.local_id
                                || seen.contains(&info.addr)
                                || failed.contains(&info.addr)
                            {
                                continue;
                            }
                            seen.insert(info.addr);
                            let distance = info.id.xor(target);
                            if distance < closest_distance {
                                closest_distance = distance;
                                round_useful = true;
                            }
                            available.push(ContactDistancePair(
                                NodeContact::new(info.id, info.addr),
                                distance,
                            ));
                        }
                        if round_useful {
                            break 'wait;
                        }
                    }
                    Ok((dest, None)) => {
                        in_flight -= 1;
                        failed.insert(dest.addr);
                    }
                    Err(_) => break 'wait,
                }
            }

            if round_useful {
                final_round = false;
                alpha = CONCURRENCY_PARAM;
            } else {
                if final_round {
                    break;
                }
                // one widened attempt against the best remaining contacts
                final_round = true;
                alpha = REPLICATION_PARAM;
                if available.is_empty() && in_flight == 0 {
                    break;
                }
            }
        }

        responded.sort_by_key(|contact| contact.distance_to(target));
        responded.truncate(REPLICATION_PARAM);
        debug!(
            "{} - lookup for {:?} settled on {} contacts",
            self.local_addr,
            target,
            responded.len()
        );
        LookupResult::Contacts(responded)
    }

    fn spawn_lookup_rpc(
        &self,
        dest: NodeContact,
        target: NodeId,
        kind: LookupKind,
        tx: Sender<(NodeContact, Option<DhtPacket>)>,
    ) {
        let node = self.clone();
        thread::spawn(move || {
            let rpc_kind = match kind {
                LookupKind::Nodes => RpcKind::FindNode,
                LookupKind::Peers => RpcKind::FindPeers,
            };
            let request = node.request(rpc_kind).with_target(target);
            let outcome = node.query(&dest, request);
            if tx.send((dest, outcome)).is_err() {
                debug!("lookup finished before straggler rpc returned");
            }
        });
    }
}
