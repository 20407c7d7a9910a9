//! Service side: introduction points and answering rendezvous requests

use super::{intro_handshake_auth, IntroducePayload};
use crate::circuit::{destroy_reason, Circuit, CircuitEvent, IncomingStream, Stream};
use crate::circuit_pool::CircuitManager;
use crate::directory::{
    onion_address, public_key_der, public_key_digest, IntroductionPoint, RendezvousServiceDescriptor,
};
use crate::error::{Result, TorError};
use crate::protocol::{
    asym_decrypt, dh_respond, end_reason, establish_intro_signed_part, sha1, Hop, RelayMsg,
    RouteTarget, Router,
};
use async_trait::async_trait;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Key size of generated service keys
const SERVICE_KEY_BITS: usize = 1024;

/// Long-term identity of a hidden service
#[derive(Clone)]
pub struct HiddenServiceKeys {
    private_key: RsaPrivateKey,
}

impl HiddenServiceKeys {
    /// Generate a fresh 1024-bit service key
    pub fn generate() -> Result<Self> {
        let mut rng = rand::thread_rng();
        Ok(Self {
            private_key: RsaPrivateKey::new(&mut rng, SERVICE_KEY_BITS)?,
        })
    }

    pub fn from_private_key(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// `<id>.onion` name of this service
    pub fn onion_address(&self) -> Result<String> {
        onion_address(&self.public_key())
    }
}

/// Application code behind a hidden service
#[async_trait]
pub trait PortHandler: Send + Sync {
    /// Whether connections to `port` are served; others are refused
    fn accepts(&self, port: u16) -> bool {
        let _ = port;
        true
    }

    /// Serve one accepted stream
    async fn handle(&self, port: u16, stream: Stream);
}

/// A running hidden service; dropping it closes the introduction circuits
pub struct HiddenService {
    onion_address: String,
    intro_circuits: Vec<Arc<Circuit>>,
    tasks: Vec<JoinHandle<()>>,
}

impl HiddenService {
    pub fn onion_address(&self) -> &str {
        &self.onion_address
    }

    /// Introduction points still open
    pub fn active_introduction_points(&self) -> usize {
        self.intro_circuits.iter().filter(|c| c.is_established()).count()
    }

    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for circuit in self.intro_circuits.drain(..) {
            circuit.destroy(destroy_reason::FINISHED);
        }
    }
}

impl Drop for HiddenService {
    fn drop(&mut self) {
        self.close();
    }
}

struct ServiceContext {
    manager: Arc<CircuitManager>,
    keys: HiddenServiceKeys,
    handler: Arc<dyn PortHandler>,
}

/// Open introduction points for `keys`, publish the descriptor and serve `handler`
pub async fn provide(
    manager: &Arc<CircuitManager>,
    keys: HiddenServiceKeys,
    handler: Arc<dyn PortHandler>,
) -> Result<HiddenService> {
    let address = keys.onion_address()?;
    let wanted = manager.settings().hidden_service_intro_points.max(1);
    let candidates = manager.selector().await?.select_introduction_points(wanted);
    log::info!("🧅 Providing {} via {} introduction point(s)", address, candidates.len());

    let mut intro_circuits = Vec::new();
    let mut introduction_points = Vec::new();
    for router in candidates {
        match establish_intro(manager, &keys, &router).await {
            Ok(circuit) => {
                introduction_points.push(IntroductionPoint {
                    router,
                    service_key: keys.public_key(),
                });
                intro_circuits.push(circuit);
            }
            Err(e) => log::warn!("⚠️ Introduction point {} failed: {}", router.nickname, e),
        }
    }
    if intro_circuits.is_empty() {
        return Err(TorError::NoUsableCircuit(format!(
            "No introduction point could be established for {}",
            address
        )));
    }

    let descriptor = RendezvousServiceDescriptor {
        service_key: keys.public_key(),
        introduction_points,
    };
    manager.directory().publish_descriptor(descriptor).await?;

    let context = Arc::new(ServiceContext {
        manager: manager.clone(),
        keys,
        handler,
    });
    let tasks = intro_circuits
        .iter()
        .map(|circuit| tokio::spawn(listen_for_introductions(context.clone(), circuit.clone())))
        .collect();

    log::info!("✅ Hidden service {} is up", address);
    Ok(HiddenService {
        onion_address: address,
        intro_circuits,
        tasks,
    })
}

/// Register the service key at `router` (ESTABLISH_INTRO → INTRO_ESTABLISHED)
async fn establish_intro(
    manager: &CircuitManager,
    keys: &HiddenServiceKeys,
    router: &Router,
) -> Result<Arc<Circuit>> {
    let circuit = manager
        .build_circuit(RouteTarget::Pinned(router.clone()), true)
        .await?;
    let last = circuit.last_hop()?;
    let kh = circuit
        .hop_kh(last)
        .ok_or_else(|| TorError::Internal("Introduction hop vanished".into()))?;

    let service_key_der = public_key_der(&keys.public_key())?;
    let handshake_auth = intro_handshake_auth(&kh);
    let digest = sha1(&establish_intro_signed_part(&service_key_der, &handshake_auth));
    let signature = keys
        .private_key
        .sign(Pkcs1v15Sign::new_unprefixed(), &digest)?;

    let sent = circuit.send_to_last_hop(RelayMsg::EstablishIntro {
        service_key_der,
        handshake_auth,
        signature,
    });
    let established = match sent {
        Ok(()) => {
            circuit
                .wait_event(
                    manager.settings().rendezvous_timeout(),
                    |event| match event {
                        CircuitEvent::Relay {
                            hop,
                            msg: RelayMsg::IntroEstablished,
                        } if hop == last => Some(Ok(())),
                        _ => None,
                    },
                    || TorError::HandshakeTimeout(format!("INTRO_ESTABLISHED from {}", router.nickname)),
                )
                .await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = established {
        circuit.destroy(destroy_reason::FINISHED);
        return Err(e);
    }
    log::debug!("📬 Introduction point {} established", router.nickname);
    Ok(circuit)
}

/// Serve INTRODUCE2 cells arriving on one introduction circuit
async fn listen_for_introductions(context: Arc<ServiceContext>, circuit: Arc<Circuit>) {
    let Ok(pk_id) = public_key_digest(&context.keys.public_key()) else {
        return;
    };
    let last = match circuit.last_hop() {
        Ok(last) => last,
        Err(_) => return,
    };
    let wait = context.manager.settings().rendezvous_timeout();
    loop {
        let next = circuit
            .wait_event(
                wait,
                |event| match event {
                    CircuitEvent::Relay {
                        hop,
                        msg: RelayMsg::Introduce2 { pk_id: id, encrypted },
                    } if hop == last => Some(Ok((id, encrypted))),
                    _ => None,
                },
                || TorError::HandshakeTimeout("idle".into()),
            )
            .await;
        match next {
            Ok((id, encrypted)) => {
                if id != pk_id {
                    log::warn!("⚠️ INTRODUCE2 for another service key, ignoring");
                    continue;
                }
                let context = context.clone();
                tokio::spawn(async move {
                    if let Err(e) = answer_introduction(context, encrypted).await {
                        log::warn!("⚠️ Could not answer introduction: {}", e);
                    }
                });
            }
            Err(TorError::HandshakeTimeout(_)) => continue,
            Err(e) => {
                log::info!("Introduction circuit {} closed: {}", circuit.serial(), e);
                return;
            }
        }
    }
}

/// Meet the client at its rendezvous point and serve its streams
async fn answer_introduction(context: Arc<ServiceContext>, encrypted: Vec<u8>) -> Result<()> {
    let plaintext = asym_decrypt(&context.keys.private_key, &encrypted)?;
    let request = IntroducePayload::decode(&plaintext)?;
    let rendezvous_point = request.rendezvous_point();
    log::info!("📨 Introduction received, meeting client at {}", rendezvous_point.nickname);

    let (reply, keys) = {
        let mut rng = rand::thread_rng();
        dh_respond(&mut rng, &request.dh_public)?
    };
    let circuit = context
        .manager
        .build_circuit(RouteTarget::Pinned(rendezvous_point), true)
        .await?;

    let (incoming_tx, mut incoming) = mpsc::unbounded_channel::<IncomingStream>();
    circuit.serve_streams(incoming_tx);
    // The client may send BEGIN right after RENDEZVOUS2, so the virtual
    // hop must be in place before RENDEZVOUS1 leaves
    let joined = circuit.last_hop().and_then(|rp| {
        circuit.attach_virtual_hop(Hop::new_reversed(&keys, None))?;
        circuit.send_relay(
            rp,
            RelayMsg::Rendezvous1 {
                cookie: request.cookie,
                reply,
            },
            0,
        )
    });
    if let Err(e) = joined {
        circuit.destroy(destroy_reason::FINISHED);
        return Err(e);
    }

    while let Some(IncomingStream { port, mut stream }) = incoming.recv().await {
        if !context.handler.accepts(port) {
            log::debug!("Refusing stream to port {}", port);
            stream.end(end_reason::EXITPOLICY);
            continue;
        }
        if let Err(e) = stream.accept() {
            log::warn!("⚠️ Could not accept stream: {}", e);
            continue;
        }
        let handler = context.handler.clone();
        tokio::spawn(async move { handler.handle(port, stream).await });
    }
    log::debug!("Rendezvous circuit {} finished", circuit.serial());
    Ok(())
}
