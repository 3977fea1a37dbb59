//! A Kademlia-style distributed hash table for serverless peer discovery.
//!
//! Peers are identified by 160-bit IDs ordered by XOR distance. Each node
//! maintains a binary trie of k-buckets covering its neighborhood of the ID
//! space and answers four RPCs (`PING`, `FIND_NODE`, `FIND_PEERS`,
//! `ANNOUNCE_PEER`) over caller-supplied byte streams. Iterative parallel
//! lookups converge on the contacts closest to a target ID without any node
//! ever knowing the whole network.

#[macro_use]
extern crate log;

mod error;
mod id;
mod node;
mod protocol;
mod routing;
mod storage;
mod transport;

pub use self::error::DhtError;
pub use self::id::NodeId;
pub use self::node::contact::NodeContact;
pub use self::node::DhtClient;
pub use self::protocol::{DhtPacket, PacketDirection, RpcKind};
pub use self::routing::RoutingTable;
pub use self::storage::PeerStore;
pub use self::transport::{Connection, ConnectionFactory, DhtListener, TcpTransport};

/// The number of bytes in a node ID.
const ID_LENGTH: usize = 20;

/// The replication parameter `k`: the number of closest contacts returned by
/// lookups and the minimum number of contacts a bucket may shrink to.
const REPLICATION_PARAM: usize = 8;

/// The maximum number of contacts held by a single bucket leaf.
const BUCKET_CAPACITY: usize = 2 * REPLICATION_PARAM;

/// The maximum number of active RPCs during a lookup round.
const CONCURRENCY_PARAM: usize = 3;

/// Request timeout in milliseconds.
const REQUEST_TIMEOUT: u64 = 5000;

/// Announced peer endpoint expiration time in seconds.
const PEER_EXPIRATION: u64 = 900;

/// A bucket left untouched for this many seconds is refreshed with a lookup
/// for a random ID inside its prefix.
const BUCKET_REFRESH_INTERVAL: u64 = 900;

/// A contact with no successful RPC within this many seconds is stale.
const CONTACT_STALE_PERIOD: u64 = 300;

/// Maintenance (peer expiry, health check, bucket refresh) interval in seconds.
const MAINTENANCE_INTERVAL: u64 = 300;

/// A contact with this many consecutive failed RPCs is stale.
const MAX_RPC_FAILURES: u32 = 3;

/// Wire format version accepted by the codec.
const PROTOCOL_VERSION: u8 = 1;

/// Leading byte written before each exchange so DHT traffic can share a port
/// with the other protocols of the client.
const STREAM_TYPE_DHT: u8 = 0x44;

/// Contact and peer lists are length-prefixed with a single byte.
const MAX_LIST_LENGTH: usize = 255;
