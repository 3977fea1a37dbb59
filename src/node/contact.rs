use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result};
use std::net::SocketAddrV4;
use time::{Duration, SteadyTime};

use crate::id::NodeId;
use crate::{CONTACT_STALE_PERIOD, MAX_RPC_FAILURES};

/// A known DHT participant: identity, endpoint, and liveness bookkeeping.
///
/// A contact created from a bare endpoint (a bootstrap node, typically) has no
/// ID until its first successful RPC resolves one. The contact representing
/// the current process carries `is_local` and is never stale, never evicted,
/// and never handed out to callers.
#[derive(Clone)]
pub struct NodeContact {
    pub id: Option<NodeId>,
    pub addr: SocketAddrV4,
    last_seen: SteadyTime,
    failed_rpcs: u32,
    pub is_local: bool,
}

impl Debug for NodeContact {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self.id {
            Some(ref id) => write!(f, "{} - {:?}", self.addr, id),
            None => write!(f, "{} - <unresolved>", self.addr),
        }
    }
}

impl NodeContact {
    /// Constructs a contact for a resolved remote node.
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        NodeContact {
            id: Some(id),
            addr,
            last_seen: SteadyTime::now(),
            failed_rpcs: 0,
            is_local: false,
        }
    }

    /// Constructs a bootstrap stub whose ID is unknown until the node first
    /// answers an RPC.
    pub fn unresolved(addr: SocketAddrV4) -> Self {
        NodeContact {
            id: None,
            addr,
            last_seen: SteadyTime::now(),
            failed_rpcs: 0,
            is_local: false,
        }
    }

    /// Constructs the sentinel contact for the current process.
    pub fn local(id: NodeId, addr: SocketAddrV4) -> Self {
        NodeContact {
            id: Some(id),
            addr,
            last_seen: SteadyTime::now(),
            failed_rpcs: 0,
            is_local: true,
        }
    }

    /// Returns `true` once the contact is eviction-eligible: either
    /// `MAX_RPC_FAILURES` consecutive failed RPCs, or no successful RPC within
    /// `CONTACT_STALE_PERIOD` seconds. The local sentinel is never stale.
    pub fn is_stale(&self) -> bool {
        if self.is_local {
            return false;
        }
        self.failed_rpcs >= MAX_RPC_FAILURES
            || SteadyTime::now() - self.last_seen > Duration::seconds(CONTACT_STALE_PERIOD as i64)
    }

    /// Records a successful RPC: failures reset, `last_seen` refreshed, and
    /// the endpoint updated in case the peer re-homed.
    pub fn record_success(&mut self, addr: SocketAddrV4) {
        self.failed_rpcs = 0;
        self.last_seen = SteadyTime::now();
        self.addr = addr;
    }

    /// Records a failed RPC. `last_seen` is deliberately left untouched.
    pub fn record_failure(&mut self) {
        self.failed_rpcs += 1;
    }

    pub fn failed_rpcs(&self) -> u32 {
        self.failed_rpcs
    }

    /// XOR distance from this contact to `target`. Unresolved contacts sort
    /// after every resolved one.
    pub fn distance_to(&self, target: &NodeId) -> NodeId {
        match self.id {
            Some(ref id) => id.xor(target),
            None => NodeId::max_value(),
        }
    }
}

/// Contacts are compared by ID once both sides are resolved, and by endpoint
/// while either side is still a bootstrap stub.
impl PartialEq for NodeContact {
    fn eq(&self, other: &NodeContact) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            _ => self.addr == other.addr,
        }
    }
}

impl Eq for NodeContact {}

/// A contact paired with its XOR distance to some target, ordered so that a
/// `BinaryHeap` pops the closest contact first.
#[derive(Clone, Debug)]
pub struct ContactDistancePair(pub NodeContact, pub NodeId);

impl ContactDistancePair {
    pub fn new(contact: NodeContact, target: &NodeId) -> Self {
        let distance = contact.distance_to(target);
        ContactDistancePair(contact, distance)
    }
}

impl PartialEq for ContactDistancePair {
    fn eq(&self, other: &ContactDistancePair) -> bool {
        self.0.eq(&other.0)
    }
}

impl Eq for ContactDistancePair {}

impl PartialOrd for ContactDistancePair {
    fn partial_cmp(&self, other: &ContactDistancePair) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContactDistancePair {
    fn cmp(&self, other: &ContactDistancePair) -> Ordering {
        other.1.cmp(&self.1)
    }
}
