//! Hidden-service connections: client rendezvous and a provided service

mod common;

use async_trait::async_trait;
use common::{default_network, service_key, test_settings, MockDirectory, MockNetwork};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tor_onion::directory::onion_id;
use tor_onion::{
    onion_address, ConnectOptions, Directory, HiddenServiceKeys, IntroductionPoint, PortHandler,
    RendezvousPhase, RendezvousServiceDescriptor, Stream, TorClient, TorError,
};

fn client(network: &MockNetwork, directory: &Arc<MockDirectory>) -> TorClient {
    TorClient::new(test_settings(), directory.clone(), Arc::new(network.clone())).unwrap()
}

/// Publish a descriptor for the shared service key with the given introduction points
fn publish(network: &MockNetwork, directory: &MockDirectory, intro_points: &[u8]) -> String {
    let service_public = service_key().to_public_key();
    directory.add_descriptor(RendezvousServiceDescriptor {
        service_key: service_public.clone(),
        introduction_points: intro_points
            .iter()
            .map(|&i| IntroductionPoint {
                router: network.router(i),
                service_key: service_public.clone(),
            })
            .collect(),
    });
    onion_address(&service_public).unwrap()
}

async fn echo(stream: &mut Stream, data: &[u8]) -> Vec<u8> {
    stream.write_all(data).await.unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    while out.len() < data.len() {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "stream closed early");
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn phase_of(err: &TorError) -> Option<RendezvousPhase> {
    match err {
        TorError::RendezvousFailed { phase, .. } => Some(*phase),
        _ => None,
    }
}

#[tokio::test]
async fn test_rendezvous_attaches_virtual_hop() {
    let (network, directory) = default_network();
    network.host_service(service_key());
    let address = publish(&network, &directory, &[4]);
    let client = client(&network, &directory);

    let mut stream = client
        .connect(&address, 80, ConnectOptions::default())
        .await
        .unwrap();

    let circuit = stream.circuit().clone();
    assert!(circuit.has_virtual_hop());
    assert!(circuit.is_exclusive());
    // Three routers to the rendezvous point plus the service
    assert_eq!(circuit.route_established(), 4);
    assert_eq!(circuit.target_len(), 4);
    assert_eq!(stream.hop(), 3);
    assert!(circuit.hop_router(3).is_none());

    assert_eq!(echo(&mut stream, b"hello service").await, b"hello service");
    assert_eq!(network.counters().introductions.load(Ordering::SeqCst), 1);

    // The joined circuit lives only as long as its stream
    drop(stream);
    assert!(circuit.is_destroyed());
}

#[tokio::test]
async fn test_virtual_hop_attaches_once() {
    let (network, directory) = default_network();
    network.host_service(service_key());
    let address = publish(&network, &directory, &[5]);
    let client = client(&network, &directory);
    let stream = client
        .connect(&address, 80, ConnectOptions::default())
        .await
        .unwrap();

    let keys = tor_onion::protocol::HopKeys::derive(&[1u8; 40]);
    let second = stream
        .circuit()
        .attach_virtual_hop(tor_onion::protocol::Hop::new(&keys, None));

    assert!(second.is_err());
    assert_eq!(stream.circuit().route_established(), 4);
}

#[tokio::test]
async fn test_refused_introduction_falls_back() {
    let (network, directory) = default_network();
    network.host_service(service_key());
    network.behavior().nack_intro.insert([4; 20]);
    let address = publish(&network, &directory, &[4, 5]);
    let client = client(&network, &directory);

    let mut stream = client
        .connect(&address, 80, ConnectOptions::default())
        .await
        .unwrap();

    assert_eq!(network.counters().introductions.load(Ordering::SeqCst), 2);
    assert_eq!(echo(&mut stream, b"second try").await, b"second try");
}

#[tokio::test]
async fn test_silent_introduction_point_times_out() {
    let (network, directory) = default_network();
    network.host_service(service_key());
    network.behavior().silent_intro.insert([6; 20]);
    let address = publish(&network, &directory, &[6, 7]);
    let client = client(&network, &directory);

    let stream = client.connect(&address, 80, ConnectOptions::default()).await;

    assert!(stream.is_ok());
    assert_eq!(network.counters().introductions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_introduction_failure_names_phase() {
    let (network, directory) = default_network();
    network.host_service(service_key());
    network.behavior().nack_intro.insert([4; 20]);
    let address = publish(&network, &directory, &[4]);
    let client = client(&network, &directory);

    let err = client
        .connect(&address, 80, ConnectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(phase_of(&err), Some(RendezvousPhase::Introduction));
    assert!(err.to_string().contains(&address));
    // One introduction per rendezvous attempt
    assert_eq!(network.counters().introductions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_descriptor() {
    let (network, directory) = default_network();
    let client = client(&network, &directory);

    let err = client
        .connect("abcdefghijklmnop.onion", 80, ConnectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(phase_of(&err), Some(RendezvousPhase::Introduction));
    assert_eq!(network.counters().links.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_refused_port_fails_stream_open() {
    let (network, directory) = default_network();
    network.host_service(service_key());
    let address = publish(&network, &directory, &[4]);
    let client = client(&network, &directory);

    // The simulated service serves every port but 81
    let err = client
        .connect(&address, 81, ConnectOptions::default())
        .await
        .unwrap_err();

    assert_eq!(phase_of(&err), Some(RendezvousPhase::StreamOpen));
}

struct EchoHandler;

#[async_trait]
impl PortHandler for EchoHandler {
    fn accepts(&self, port: u16) -> bool {
        port == 80
    }

    async fn handle(&self, _port: u16, mut stream: Stream) {
        let mut buf = [0u8; 512];
        while let Ok(n) = stream.read(&mut buf).await {
            if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_provided_service_end_to_end() {
    let (network, directory) = default_network();
    let client = client(&network, &directory);
    let keys = HiddenServiceKeys::from_private_key(service_key().clone());
    let id = onion_id(&keys.public_key()).unwrap();

    let mut service = client
        .provide_hidden_service(keys, Arc::new(EchoHandler))
        .await
        .unwrap();
    assert_eq!(service.onion_address(), format!("{}.onion", id));
    assert_eq!(service.active_introduction_points(), 3);
    assert!(directory.has_descriptor(&id));

    let address = service.onion_address().to_string();
    let mut stream = client
        .connect(&address, 80, ConnectOptions::default())
        .await
        .unwrap();
    assert_eq!(echo(&mut stream, b"through the rendezvous point").await, b"through the rendezvous point");

    let mut second = client
        .connect(&address, 80, ConnectOptions::default())
        .await
        .unwrap();
    assert_ne!(second.circuit().serial(), stream.circuit().serial());
    assert_eq!(echo(&mut second, b"again").await, b"again");

    let refused = client
        .connect(&address, 22, ConnectOptions::default())
        .await
        .unwrap_err();
    assert_eq!(phase_of(&refused), Some(RendezvousPhase::StreamOpen));

    service.close();
    assert_eq!(service.active_introduction_points(), 0);
}

#[tokio::test]
async fn test_provide_needs_a_publishing_directory() {
    let (network, _) = default_network();
    let directory = Arc::new(ReadOnlyDirectory(MockDirectory::new(network.routers())));
    let client = TorClient::new(test_settings(), directory, Arc::new(network.clone())).unwrap();

    let result = client
        .provide_hidden_service(
            HiddenServiceKeys::from_private_key(service_key().clone()),
            Arc::new(EchoHandler),
        )
        .await;

    assert!(matches!(result, Err(TorError::Directory(_))));
}

/// Directory that keeps the default (refusing) publish behavior
struct ReadOnlyDirectory(MockDirectory);

#[async_trait]
impl Directory for ReadOnlyDirectory {
    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    async fn valid_routers(&self) -> tor_onion::Result<Vec<tor_onion::protocol::Router>> {
        self.0.valid_routers().await
    }

    async fn service_descriptor(&self, onion_id: &str) -> tor_onion::Result<RendezvousServiceDescriptor> {
        self.0.service_descriptor(onion_id).await
    }
}
