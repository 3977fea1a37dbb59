#[macro_use]
extern crate log;

use mesh_dht::{DhtClient, DhtListener, NodeId, TcpTransport};
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

/// Brings up one DHT node on an ephemeral loopback port.
fn spawn_node() -> (DhtClient, DhtListener) {
    let mut listener = DhtListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .expect("Error: could not bind listener.");
    let client = DhtClient::new(
        listener.local_addr().port(),
        Arc::new(TcpTransport::default()),
    );
    listener
        .start(client.clone())
        .expect("Error: could not start listener.");
    let _ = client.start_maintenance();
    (client, listener)
}

fn main() {
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    let (seed, mut seed_listener) = spawn_node();
    let bootstrap = seed_listener.local_addr();

    let mut nodes = Vec::new();
    for _ in 0..8 {
        let (client, listener) = spawn_node();
        client.add_node(bootstrap);
        nodes.push((client, listener));
    }

    let network = NodeId::from_network_key("demo-swarm");
    let publisher = &nodes[0].0;
    match publisher.announce(&network, 1234) {
        Some(peers) => info!("announce saw existing peers: {:?}", peers),
        None => warn!("announce could not determine the closest nodes"),
    }

    let searcher = &nodes[5].0;
    match searcher.find_peers(&network) {
        Some(peers) => info!("peers serving demo-swarm: {:?}", peers),
        None => warn!("no peers found for demo-swarm"),
    }
    info!(
        "searcher knows {} nodes after the lookup",
        searcher.total_nodes()
    );

    for (client, mut listener) in nodes {
        client.stop();
        listener.stop();
    }
    seed.stop();
    seed_listener.stop();
}
