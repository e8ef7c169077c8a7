//! Failed dials are charged to the endpoint's reputation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peernet::config::NodeConfig;
use peernet::protocol::bitcoin::BitcoinProtocol;
use peernet::reputation::{NotifyOutcome, PeerEvent};
use peernet::transport::CloseReason;
use peernet::{Endpoint, Node};
use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn config(dir: &TempDir) -> NodeConfig {
    NodeConfig::default_with_overrides(|c| {
        c.network.data_dir = dir.path().to_path_buf();
        c.network.connect_timeout = Duration::from_secs(2);
        c.transport.worker_threads = 2;
        c.transport.poll_timeout = Duration::from_millis(20);
        c.transport.shutdown_backoff = Duration::from_millis(50);
    })
}

fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_refused_connect_records_failure() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(config(&dir), BitcoinProtocol::new().unwrap()).unwrap();
    let target = refused_addr();
    let endpoint = Endpoint::from(target);

    match node.connect(target) {
        Ok(conn) => {
            wait_for("connect failure", || conn.is_closed());
            assert_eq!(conn.close_reason(), Some(CloseReason::Connect));
        }
        // Some platforms refuse loopback connects synchronously.
        Err(_) => {}
    }

    wait_for("failure record", || {
        node.reputation()
            .get(&endpoint)
            .is_some_and(|r| r.last_fail > 0)
    });
    let record = node.reputation().get(&endpoint).unwrap();
    assert!(record.last_attempt > 0);
    assert_eq!(record.last_success, 0);
    assert!(node.metrics().snapshot().connect_failures >= 1);

    wait_for("table cleanup", || node.connection_count() == 0);
    node.shutdown().unwrap();
}

#[test]
fn test_failed_candidate_is_not_redialed_during_cooldown() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(config(&dir), BitcoinProtocol::new().unwrap()).unwrap();
    let endpoint = Endpoint::from(refused_addr());

    let now = node.reputation().now();
    node.reputation()
        .notify(endpoint, PeerEvent::PeerNotify { claimed: now });
    node.reputation().notify(endpoint, PeerEvent::ConnectFail);

    // Several admission rounds pass without touching the cooling endpoint.
    std::thread::sleep(Duration::from_millis(2500));
    let record = node.reputation().get(&endpoint).unwrap();
    assert_eq!(record.last_attempt, 0);
    assert_eq!(node.metrics().snapshot().connect_attempts, 0);
    node.shutdown().unwrap();
}

#[test]
fn test_snapshot_survives_restart() {
    let dir = TempDir::new().unwrap();
    let endpoint = Endpoint::from(refused_addr());
    {
        let node = Node::start(config(&dir), BitcoinProtocol::new().unwrap()).unwrap();
        node.reputation().notify(endpoint, PeerEvent::ConnectFail);
        node.shutdown().unwrap();
    }
    assert!(dir.path().join("peers.dat").exists());

    let node = Node::start(config(&dir), BitcoinProtocol::new().unwrap()).unwrap();
    let record = node.reputation().get(&endpoint).expect("record reloaded");
    assert!(record.last_fail > 0);
    node.shutdown().unwrap();
}

#[test]
fn test_unroutable_gossip_is_ignored() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.network.max_outbound = 0;
    let node = Node::start(config, BitcoinProtocol::new().unwrap()).unwrap();
    let context = node.context();

    let port_zero = Endpoint::from_socket_addr(([203, 0, 113, 9], 0).into()).with_timestamp(1);
    let unspecified = Endpoint::from_socket_addr(([0, 0, 0, 0], 8333).into()).with_timestamp(1);
    assert_eq!(context.learn(port_zero), NotifyOutcome::Unchanged);
    assert_eq!(context.learn(unspecified), NotifyOutcome::Unchanged);
    assert!(!node.reputation().contains(&port_zero));
    assert!(!node.reputation().contains(&unspecified));

    let routable = Endpoint::from_socket_addr(([203, 0, 113, 9], 8333).into()).with_timestamp(1);
    assert_eq!(context.learn(routable), NotifyOutcome::New);
    assert!(node.reputation().contains(&routable));
    node.shutdown().unwrap();
}
