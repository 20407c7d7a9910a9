//! Background circuit management: idle pool, keepalives and status

mod common;

use common::{default_network, test_settings};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tor_onion::{CircuitStatus, ConnectOptions, Settings, TorClient};

fn pool_settings() -> Settings {
    Settings {
        min_idle_circuits: 4,
        maintenance_interval_ms: 50,
        ..test_settings()
    }
}

/// Poll the client until no build is in flight and `ready` holds
async fn settle(client: &TorClient, ready: impl Fn(&CircuitStatus) -> bool) -> CircuitStatus {
    for _ in 0..300 {
        let status = client.status();
        if status.building == 0 && ready(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client did not settle: {:?}", client.status());
}

#[tokio::test]
async fn test_idle_pool_is_filled_and_bounded() {
    let (network, directory) = default_network();
    let settings = pool_settings();
    let (min, max) = (settings.min_idle_circuits, settings.max_idle_circuits());
    let client = TorClient::new(settings, directory, Arc::new(network.clone())).unwrap();

    let status = settle(&client, |s| s.established >= min).await;
    assert!(status.alive >= min && status.alive <= max, "{:?}", status);
    assert_eq!(status.streams, 0);

    // Further passes do not grow a full pool
    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = client.status();
    assert!(later.alive <= max, "{:?}", later);
    assert_eq!(later.closed, 0);
}

#[tokio::test]
async fn test_no_builds_until_directory_is_ready() {
    let (network, directory) = default_network();
    directory.set_ready(false);
    let client = TorClient::new(pool_settings(), directory.clone(), Arc::new(network.clone())).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.is_ready());
    assert_eq!(client.status(), CircuitStatus::default());
    assert_eq!(network.counters().links.load(Ordering::SeqCst), 0);

    directory.set_ready(true);
    settle(&client, |s| s.established >= 4).await;
    assert!(client.is_ready());
}

#[tokio::test]
async fn test_destroyed_circuits_are_replaced() {
    let (network, directory) = default_network();
    let client = TorClient::new(pool_settings(), directory, Arc::new(network.clone())).unwrap();
    settle(&client, |s| s.established >= 4).await;

    network.destroy_all(2);

    let status = settle(&client, |s| s.closed >= 4 && s.established >= 4).await;
    assert!(status.total >= 8);
    assert!(status.alive <= 6);
}

#[tokio::test]
async fn test_silent_circuits_get_keepalives() {
    let (network, directory) = default_network();
    let settings = Settings {
        min_idle_circuits: 1,
        keepalive_idle_ms: 20,
        maintenance_interval_ms: 50,
        ..test_settings()
    };
    let client = TorClient::new(settings, directory, Arc::new(network.clone())).unwrap();
    settle(&client, |s| s.established >= 1).await;

    assert!(network.wait_until(|n| n.counters().keepalives.load(Ordering::SeqCst) >= 2).await);
}

#[tokio::test]
async fn test_used_circuit_is_retired_when_idle() {
    let (network, directory) = default_network();
    let settings = Settings {
        circuit_idle_timeout_ms: 100,
        maintenance_interval_ms: 20,
        ..test_settings()
    };
    let client = TorClient::new(settings, directory, Arc::new(network.clone())).unwrap();

    let stream = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();
    let circuit = stream.circuit().clone();
    // A circuit with an open stream stays
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(circuit.is_established());

    drop(stream);
    let retired = circuit.clone();
    assert!(network.wait_until(move |_| retired.is_destroyed()).await);
    settle(&client, |s| s.alive == 0 && s.closed == 1).await;
}

#[tokio::test]
async fn test_keepalives_do_not_keep_used_circuit_alive() {
    let (network, directory) = default_network();
    let settings = Settings {
        circuit_idle_timeout_ms: 300,
        keepalive_idle_ms: 50,
        maintenance_interval_ms: 20,
        ..test_settings()
    };
    let client = TorClient::new(settings, directory, Arc::new(network.clone())).unwrap();

    let stream = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();
    let circuit = stream.circuit().clone();
    drop(stream);

    let retired = circuit.clone();
    assert!(network.wait_until(move |_| retired.is_destroyed()).await);
    assert!(network.counters().keepalives.load(Ordering::SeqCst) >= 1);
    settle(&client, |s| s.alive == 0 && s.closed == 1).await;
}

#[tokio::test]
async fn test_status_json() {
    let (network, directory) = default_network();
    let client = TorClient::new(test_settings(), directory, Arc::new(network.clone())).unwrap();
    let _stream = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();

    let json = client.status_json();
    assert_eq!(json["ready"], true);
    assert_eq!(json["circuits"]["alive"], 1);
    assert_eq!(json["circuits"]["streams"], 1);
    assert_eq!(json["connections"]["current_pool_size"], 1);
}

#[tokio::test]
async fn test_close_destroys_everything() {
    let (network, directory) = default_network();
    let client = TorClient::new(pool_settings(), directory, Arc::new(network.clone())).unwrap();
    settle(&client, |s| s.established >= 4).await;

    client.close();

    assert_eq!(client.status().alive, 0);
    assert!(!client.is_ready());
    assert!(network.wait_until(|n| n.circuit_count() == 0).await);
    assert!(client.connect("example.com", 80, ConnectOptions::default()).await.is_err());
}
