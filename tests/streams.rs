//! Streams through exits: data, flow control, RESOLVE, BEGIN_DIR and closing

mod common;

use common::{default_network, test_settings, MockDirectory, MockNetwork, CLOSE_AFTER_ECHO, EXIT_ADDRESS, UNRESOLVABLE};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tor_onion::circuit::CircuitBuilder;
use tor_onion::protocol::{end_reason, RelayCell};
use tor_onion::{ConnectOptions, ConnectionPool, Settings, Stream, StreamTarget, TorClient, TorError};

fn client(network: &MockNetwork, directory: &Arc<MockDirectory>, settings: Settings) -> TorClient {
    TorClient::new(settings, directory.clone(), Arc::new(network.clone())).unwrap()
}

async fn read_exact(stream: &mut Stream, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 1024];
    while out.len() < len {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "stream closed after {} of {} bytes", out.len(), len);
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[tokio::test]
async fn test_stream_echo_through_exit() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());

    let mut stream = client
        .connect("example.com", 80, ConnectOptions::default())
        .await
        .unwrap();
    assert!(stream.is_established());
    assert!(stream.circuit().allows_exit_port(80));

    stream.write_all(b"hello").await.unwrap();
    assert_eq!(read_exact(&mut stream, 5).await, b"hello");
    assert_eq!(client.status().streams, 1);
}

#[tokio::test]
async fn test_streams_interleave_on_one_circuit() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());

    let mut first = client.connect("a.example", 443, ConnectOptions::default()).await.unwrap();
    let mut second = client.connect("b.example", 443, ConnectOptions::default()).await.unwrap();
    assert_eq!(first.circuit().serial(), second.circuit().serial());
    assert_ne!(first.id(), second.id());
    assert_eq!(first.circuit().stream_count(), 2);

    first.write_all(b"one").await.unwrap();
    second.write_all(b"two").await.unwrap();
    first.write_all(b"three").await.unwrap();

    assert_eq!(read_exact(&mut second, 3).await, b"two");
    assert_eq!(read_exact(&mut first, 8).await, b"onethree");
}

#[tokio::test]
async fn test_large_transfer_uses_sendmes() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());
    let mut stream = client.connect("bulk.example", 80, ConnectOptions::default()).await.unwrap();

    // More cells than the 500-cell stream window
    let cells = 600;
    let data: Vec<u8> = (0..cells * RelayCell::MAX_DATA_SIZE).map(|i| (i % 251) as u8).collect();
    stream.write_all(&data).await.unwrap();

    let echoed = read_exact(&mut stream, data.len()).await;
    assert_eq!(echoed, data);

    // 12 stream-level and 6 circuit-level SENDMEs for 600 received cells
    assert!(network.wait_until(|n| n.counters().sendmes.load(Ordering::SeqCst) == 18).await);
}

#[tokio::test]
async fn test_resolve() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());

    let addrs = client.resolve("example.com").await.unwrap();
    assert_eq!(addrs, vec![IpAddr::V4(EXIT_ADDRESS)]);

    let err = client.resolve(UNRESOLVABLE).await.unwrap_err();
    assert!(matches!(err, TorError::Stream(_)));
    // RESOLVE streams do not linger
    assert_eq!(client.status().streams, 0);
}

#[tokio::test]
async fn test_resolve_retries_on_another_circuit() {
    let (network, directory) = default_network();
    network.behavior().failing_resolves = 1;
    let client = client(&network, &directory, test_settings());

    let addrs = client.resolve("example.com").await.unwrap();

    assert_eq!(addrs, vec![IpAddr::V4(EXIT_ADDRESS)]);
    assert_eq!(network.counters().resolves.load(Ordering::SeqCst), 2);
    // The first exit's circuit stays usable, the retry went elsewhere
    assert_eq!(client.status().alive, 2);
}

#[tokio::test]
async fn test_resolve_gives_up_after_retries() {
    let (network, directory) = default_network();
    let settings = Settings {
        connect_retries: 2,
        ..test_settings()
    };
    let client = client(&network, &directory, settings);

    let err = client.resolve(UNRESOLVABLE).await.unwrap_err();

    assert!(matches!(err, TorError::Stream(_)));
    assert_eq!(network.counters().resolves.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_directory_stream() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());

    let mut stream = client.connect_directory().await.unwrap();
    stream.write_all(b"GET /tor/status-vote/current/consensus").await.unwrap();
    let reply = read_exact(&mut stream, 38).await;
    assert!(reply.starts_with(b"GET /tor/"));
}

#[tokio::test]
async fn test_exit_policy_refusal() {
    let (network, _) = default_network();
    let pool = Arc::new(ConnectionPool::new(Arc::new(network.clone())));
    let builder = CircuitBuilder::new(Arc::new(test_settings()), pool);
    // Router 5 is a middle that exits nowhere
    let circuit = builder
        .build(&[network.router(1), network.router(5)])
        .await
        .unwrap();
    assert!(!circuit.allows_exit_port(80));

    let err = circuit
        .open_stream(StreamTarget::Host {
            address: "example.com".into(),
            port: 80,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, TorError::StreamClosed(reason) if reason == end_reason::EXITPOLICY));
    assert!(circuit.is_established());
    assert_eq!(circuit.stream_count(), 0);
}

#[tokio::test]
async fn test_remote_end_closes_stream() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());
    let mut stream = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();

    stream.write_all(CLOSE_AFTER_ECHO).await.unwrap();

    assert_eq!(stream.read_to_end().await.unwrap(), CLOSE_AFTER_ECHO);
    assert_eq!(stream.remote_end_reason(), Some(end_reason::DONE));
    assert!(matches!(
        stream.write_all(b"late").await,
        Err(TorError::StreamClosed(reason)) if reason == end_reason::DONE
    ));

    // Closing after the peer's END sends nothing more
    let circuit = stream.circuit().clone();
    drop(stream);
    assert_eq!(circuit.stream_count(), 0);
    assert_eq!(network.counters().ends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_dropping_stream_sends_end() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());
    let stream = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();
    let circuit = stream.circuit().clone();

    stream.close();

    assert_eq!(circuit.stream_count(), 0);
    assert!(circuit.is_established());
    assert!(network.wait_until(|n| n.counters().ends.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn test_isolated_stream_gets_its_own_circuit() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());

    let shared = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();
    let isolated = client
        .connect("example.com", 80, ConnectOptions { isolated: true })
        .await
        .unwrap();

    let circuit = isolated.circuit().clone();
    assert!(circuit.is_exclusive());
    assert_ne!(circuit.serial(), shared.circuit().serial());

    // The isolated circuit closes with its only stream
    drop(isolated);
    assert!(circuit.is_destroyed());
    assert!(shared.circuit().is_established());
}

#[tokio::test]
async fn test_destroy_ends_open_streams() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());
    let mut stream = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();

    network.destroy_all(2);

    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    assert_eq!(stream.remote_end_reason(), Some(end_reason::DESTROY));
    assert!(stream.circuit().is_destroyed());
    assert!(stream.write_all(b"x").await.is_err());
}

#[tokio::test]
async fn test_new_circuit_after_destroy() {
    let (network, directory) = default_network();
    let client = client(&network, &directory, test_settings());
    let first = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();
    let old = first.circuit().clone();
    drop(first);

    network.destroy_all(2);
    let destroyed = old.clone();
    assert!(network.wait_until(move |_| destroyed.is_destroyed()).await);

    let mut stream = client.connect("example.com", 80, ConnectOptions::default()).await.unwrap();
    assert_ne!(stream.circuit().serial(), old.serial());
    stream.write_all(b"again").await.unwrap();
    assert_eq!(read_exact(&mut stream, 5).await, b"again");
}

#[tokio::test]
async fn test_aggressive_stream_building() {
    let (network, directory) = default_network();
    let settings = Settings {
        very_aggressive_stream_building: true,
        aggressive_parallelism: 2,
        ..test_settings()
    };
    let client = client(&network, &directory, settings);

    let mut stream = client.connect("race.example", 80, ConnectOptions::default()).await.unwrap();
    stream.write_all(b"winner").await.unwrap();
    assert_eq!(read_exact(&mut stream, 6).await, b"winner");
}
