//! Client side of the rendezvous protocol

use super::IntroducePayload;
use crate::circuit::{destroy_reason, Circuit, CircuitEvent, Stream, StreamTarget};
use crate::circuit_pool::CircuitManager;
use crate::directory::{public_key_digest, IntroductionPoint, RendezvousServiceDescriptor, ONION_SUFFIX};
use crate::error::{RendezvousPhase, Result, TorError};
use crate::protocol::{asym_encrypt, DhKeyPair, Hop, RelayMsg, RouteTarget, Router, COOKIE_LEN};
use rand::RngCore;
use std::sync::Arc;

/// Destroys a circuit on drop unless disarmed
struct CircuitGuard(Option<Arc<Circuit>>);

impl CircuitGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CircuitGuard {
    fn drop(&mut self) {
        if let Some(circuit) = self.0.take() {
            circuit.destroy(destroy_reason::FINISHED);
        }
    }
}

/// Open a stream to `port` of the service with identifier `onion_id`
///
/// Whole rendezvous attempts are retried up to the configured count. The
/// error names the phase of the last failed attempt.
pub async fn connect(manager: &Arc<CircuitManager>, onion_id: &str, port: u16) -> Result<Stream> {
    let destination = format!("{}{}:{}", onion_id, ONION_SUFFIX, port);
    let descriptor = fetch_descriptor(manager, onion_id)
        .await
        .map_err(|e| e.in_rendezvous_phase(RendezvousPhase::Introduction, &destination))?;

    let attempts = manager.settings().rendezvous_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        log::info!("🧅 Connecting to {} (attempt {}/{})", destination, attempt, attempts);
        match rendezvous(manager, &descriptor, port, &destination).await {
            Ok(stream) => {
                log::info!("✅ Connected to {}", destination);
                return Ok(stream);
            }
            Err(e) => {
                log::warn!("⚠️ Rendezvous with {} failed: {}", destination, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| TorError::RendezvousFailed {
        phase: RendezvousPhase::RendezvousPointSetup,
        destination,
        cause: "no attempt made".into(),
    }))
}

async fn fetch_descriptor(manager: &CircuitManager, onion_id: &str) -> Result<RendezvousServiceDescriptor> {
    let descriptor = manager.directory().service_descriptor(onion_id).await?;
    let actual = descriptor.onion_id()?;
    if actual != onion_id {
        return Err(TorError::Directory(format!(
            "Descriptor for {} carries the key of {}",
            onion_id, actual
        )));
    }
    if descriptor.introduction_points.is_empty() {
        return Err(TorError::Directory(format!("{} lists no introduction points", onion_id)));
    }
    Ok(descriptor)
}

/// One full rendezvous attempt
async fn rendezvous(
    manager: &Arc<CircuitManager>,
    descriptor: &RendezvousServiceDescriptor,
    port: u16,
    destination: &str,
) -> Result<Stream> {
    let (circuit, rendezvous_point, cookie) = establish_rendezvous(manager)
        .await
        .map_err(|e| e.in_rendezvous_phase(RendezvousPhase::RendezvousPointSetup, destination))?;
    let guard = CircuitGuard(Some(circuit.clone()));

    let dh = {
        let mut rng = rand::thread_rng();
        DhKeyPair::generate(&mut rng)
    };
    let payload = IntroducePayload::new(&rendezvous_point, cookie, dh.public_bytes());
    introduce(manager, descriptor, &payload)
        .await
        .map_err(|e| e.in_rendezvous_phase(RendezvousPhase::Introduction, destination))?;

    complete_rendezvous(&circuit, &dh)
        .await
        .map_err(|e| e.in_rendezvous_phase(RendezvousPhase::RendezvousCompletion, destination))?;

    circuit.set_close_on_last_stream(true);
    let stream = circuit
        .open_stream(StreamTarget::HiddenService { port })
        .await
        .map_err(|e| e.in_rendezvous_phase(RendezvousPhase::StreamOpen, destination))?;
    guard.disarm();
    Ok(stream)
}

/// Phase 1: an exclusive circuit to a rendezvous point, waiting with our cookie
async fn establish_rendezvous(manager: &CircuitManager) -> Result<(Arc<Circuit>, Router, [u8; COOKIE_LEN])> {
    let rendezvous_point = manager.selector().await?.select_rendezvous_point()?;
    let circuit = manager
        .build_circuit(RouteTarget::Pinned(rendezvous_point.clone()), true)
        .await?;
    let guard = CircuitGuard(Some(circuit.clone()));

    let mut cookie = [0u8; COOKIE_LEN];
    rand::thread_rng().fill_bytes(&mut cookie);
    circuit.send_to_last_hop(RelayMsg::EstablishRendezvous { cookie })?;
    let last = circuit.last_hop()?;
    circuit
        .wait_event(
            manager.settings().rendezvous_timeout(),
            |event| match event {
                CircuitEvent::Relay {
                    hop,
                    msg: RelayMsg::RendezvousEstablished,
                } if hop == last => Some(Ok(())),
                _ => None,
            },
            || TorError::HandshakeTimeout("RENDEZVOUS_ESTABLISHED".into()),
        )
        .await?;

    log::debug!("🤝 Rendezvous point {} ready", rendezvous_point.nickname);
    guard.disarm();
    Ok((circuit, rendezvous_point, cookie))
}

/// Phase 2: try introduction points in descriptor order until one acknowledges
async fn introduce(
    manager: &CircuitManager,
    descriptor: &RendezvousServiceDescriptor,
    payload: &IntroducePayload,
) -> Result<()> {
    let plaintext = payload.encode()?;
    let mut last_error = None;
    for point in &descriptor.introduction_points {
        match introduce_via(manager, point, &plaintext).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("⚠️ Introduction point {} failed: {}", point.router.nickname, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| TorError::NoUsableCircuit("No introduction points".into())))
}

async fn introduce_via(manager: &CircuitManager, point: &IntroductionPoint, plaintext: &[u8]) -> Result<()> {
    let encrypted = {
        let mut rng = rand::thread_rng();
        let mut key = [0u8; 16];
        rng.fill_bytes(&mut key);
        asym_encrypt(&mut rng, &point.service_key, &key, plaintext)?
    };
    let pk_id = public_key_digest(&point.service_key)?;

    let circuit = manager
        .build_circuit(RouteTarget::Pinned(point.router.clone()), true)
        .await?;
    let _guard = CircuitGuard(Some(circuit.clone()));

    circuit.send_to_last_hop(RelayMsg::Introduce1 { pk_id, encrypted })?;
    let last = circuit.last_hop()?;
    let accepted = circuit
        .wait_event(
            manager.settings().rendezvous_timeout(),
            |event| match event {
                CircuitEvent::Relay {
                    hop,
                    msg: RelayMsg::IntroduceAck { accepted },
                } if hop == last => Some(Ok(accepted)),
                _ => None,
            },
            || TorError::HandshakeTimeout(format!("INTRODUCE_ACK from {}", point.router.nickname)),
        )
        .await?;
    if !accepted {
        return Err(TorError::ProtocolError(format!(
            "{} refused the introduction",
            point.router.nickname
        )));
    }
    log::debug!("📨 Introduced through {}", point.router.nickname);
    Ok(())
}

/// Phase 3: finish DH with the service's RENDEZVOUS2 and attach the virtual hop
async fn complete_rendezvous(circuit: &Arc<Circuit>, dh: &DhKeyPair) -> Result<()> {
    let last = circuit.last_hop()?;
    let reply = circuit
        .wait_event(
            circuit.settings().rendezvous_timeout(),
            |event| match event {
                CircuitEvent::Relay {
                    hop,
                    msg: RelayMsg::Rendezvous2 { reply },
                } if hop == last => Some(Ok(reply)),
                _ => None,
            },
            || TorError::HandshakeTimeout("RENDEZVOUS2".into()),
        )
        .await?;
    let keys = dh.complete(&reply)?;
    circuit.attach_virtual_hop(Hop::new(&keys, None))
}
