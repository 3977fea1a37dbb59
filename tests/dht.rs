//! End-to-end tests over loopback TCP: real listeners, real sockets, no
//! background maintenance threads, so every assertion runs against a settled
//! state.

use mesh_dht::{DhtClient, DhtListener, NodeId, TcpTransport};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct TestNode {
    client: DhtClient,
    listener: DhtListener,
}

fn spawn_node() -> TestNode {
    let mut listener = DhtListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .expect("could not bind loopback listener");
    let client = DhtClient::new(
        listener.local_addr().port(),
        Arc::new(TcpTransport::default()),
    );
    listener
        .start(client.clone())
        .expect("could not start listener");
    TestNode { client, listener }
}

impl TestNode {
    fn addr(&self) -> SocketAddrV4 {
        self.listener.local_addr()
    }
}

#[test]
fn three_node_announce_and_find_peers() {
    let b = spawn_node();
    let a = spawn_node();
    let c = spawn_node();

    // A announces network X on service port 1234, reaching the network via B
    a.client.add_node(b.addr());
    let network = NodeId::from_network_key("swarm-x");
    let seen = a.client.announce(&network, 1234);
    assert!(seen.is_some(), "announce should reach B");

    // C, knowing only B, finds A's service endpoint
    c.client.add_node(b.addr());
    let peers = c
        .client
        .find_peers(&network)
        .expect("B should return A's announced endpoint");
    assert!(peers.contains(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1234)));
}

#[test]
fn find_peers_for_unknown_network_is_none() {
    let a = spawn_node();
    let b = spawn_node();
    a.client.add_node(b.addr());
    assert!(a
        .client
        .find_peers(&NodeId::from_network_key("nobody-announced-this"))
        .is_none());
}

#[test]
fn add_node_is_idempotent_and_resolves_id() {
    let a = spawn_node();
    let b = spawn_node();

    a.client.add_node(b.addr());
    a.client.add_node(b.addr());
    assert_eq!(a.client.total_nodes(), 1);

    let contacts = a.client.all_nodes();
    assert_eq!(contacts[0].id, Some(b.client.local_id()));
    assert_eq!(contacts[0].addr, b.addr());
}

#[test]
fn inbound_query_registers_the_sender() {
    let a = spawn_node();
    let b = spawn_node();

    a.client.add_node(b.addr());
    // B answered A's ping, and that ping also introduced A to B
    assert_eq!(b.client.total_nodes(), 1);
    assert_eq!(b.client.all_nodes()[0].id, Some(a.client.local_id()));
}

#[test]
fn lookup_traverses_an_intermediate_node() {
    let a = spawn_node();
    let b = spawn_node();
    let c = spawn_node();
    let d = spawn_node();

    a.client.add_node(b.addr());
    c.client.add_node(b.addr());

    // C only knows B, but the announce lookup walks through B and reaches A
    let network = NodeId::from_network_key("multi-hop");
    c.client.announce(&network, 5555).expect("lookup should settle");

    // D bootstraps off B and finds C's announcement
    d.client.add_node(b.addr());
    let peers = d
        .client
        .find_peers(&network)
        .expect("announcement should be discoverable");
    assert!(peers.contains(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5555)));
}

#[test]
fn stop_halts_maintenance_promptly() {
    let mut a = spawn_node();
    let maintenance = a.client.start_maintenance();
    thread::sleep(Duration::from_millis(50));

    a.client.stop();
    let begin = Instant::now();
    maintenance.join().expect("maintenance thread panicked");
    // the timer must notice the stop flag long before the next cycle is due
    assert!(begin.elapsed() < Duration::from_secs(5));
    a.listener.stop();
}

#[test]
fn unresponsive_contact_survives_in_small_bucket() {
    let a = spawn_node();
    let mut b = spawn_node();

    a.client.add_node(b.addr());
    assert_eq!(a.client.total_nodes(), 1);

    // take B down; its contact accumulates failures across maintenance
    // cycles but is never evicted while the bucket holds <= k contacts
    b.client.stop();
    b.listener.stop();
    for _ in 0..4 {
        a.client.run_maintenance_cycle();
    }

    assert_eq!(a.client.total_nodes(), 1);
    assert!(a.client.all_nodes()[0].failed_rpcs() >= 3);
}
