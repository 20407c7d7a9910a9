//! In-process relay network for integration tests
//!
//! Every transport connection is a `tokio::io::duplex` pipe whose far end
//! is served by a simulated relay. All relays share one state table, so a
//! circuit's whole relay side (every hop, reversed) lives in one place:
//! EXTEND is answered with the target relay's key directly, and the
//! rendezvous point splices circuits by re-layering cells between them.

#![allow(dead_code)]

use async_trait::async_trait;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tor_onion::directory::{public_key_digest, RendezvousServiceDescriptor};
use tor_onion::hidden_service::IntroducePayload;
use tor_onion::protocol::{
    answer_onion_skin, asym_decrypt, dh_respond, end_reason, establish_intro_signed_part,
    fast_respond, layer, peel, read_cell, sha1, write_cell, Cell, CellCommand, ExitPolicy,
    Fingerprint, Hop, RelayCell, RelayMsg, ResolvedAnswer, Router, RouterFlags, FAST_KEY_LEN,
    ONION_SKIN_LEN,
};
use tor_onion::{Directory, Result, Settings, TorError, Transport, TransportStream};

/// Address every simulated exit reports and resolves to
pub const EXIT_ADDRESS: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// Host name the simulated exits cannot resolve
pub const UNRESOLVABLE: &str = "nonexistent.invalid";

/// Data that makes the far end echo and then close the stream
pub const CLOSE_AFTER_ECHO: &[u8] = b"QUIT";

/// Shared 1024-bit onion key of all simulated relays (generation is slow)
pub fn relay_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
}

/// Shared 1024-bit hidden-service key
pub fn service_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
}

/// Settings with short timeouts and no idle pool, so tests control every build
pub fn test_settings() -> Settings {
    Settings {
        min_idle_circuits: 0,
        circuit_build_timeout_ms: 2_000,
        stream_open_timeout_ms: 2_000,
        resolve_timeout_ms: 2_000,
        rendezvous_timeout_ms: 1_000,
        maintenance_interval_ms: 60_000,
        ..Settings::default()
    }
}

/// A router of the simulated network; `i` picks fingerprint and /16
pub fn router(i: u8, flags: &str, exit_policy: ExitPolicy) -> Router {
    Router {
        nickname: format!("relay{}", i),
        fingerprint: [i; 20],
        address: Ipv4Addr::new(10, i, 0, 1),
        or_port: 9001,
        onion_key: relay_key().to_public_key(),
        flags: RouterFlags::from_string(flags),
        bandwidth: 1_000_000,
        exit_policy,
    }
}

/// Eight relays: 1-3 guards, 4-5 middles, 6-8 exits
pub fn default_routers() -> Vec<Router> {
    let mut routers = Vec::new();
    for i in 1..=3 {
        routers.push(router(i, "Running Valid Fast Stable Guard", ExitPolicy::default()));
    }
    for i in 4..=5 {
        routers.push(router(i, "Running Valid Fast Stable", ExitPolicy::default()));
    }
    for i in 6..=8 {
        routers.push(router(i, "Running Valid Fast Stable Exit", ExitPolicy::accept_all()));
    }
    routers
}

/// Failure modes the simulated relays can be told to exhibit
#[derive(Default)]
pub struct Behavior {
    /// EXTEND to these relays yields TRUNCATED
    pub unreachable: HashSet<Fingerprint>,
    /// EXTEND to these relays is never answered
    pub silent_extend: HashSet<Fingerprint>,
    /// These introduction points never answer INTRODUCE1
    pub silent_intro: HashSet<Fingerprint>,
    /// These introduction points refuse INTRODUCE1
    pub nack_intro: HashSet<Fingerprint>,
    /// Transport connections to these relays fail
    pub refuse_links: HashSet<Fingerprint>,
    /// The next this many RESOLVEs get only an error answer
    pub failing_resolves: usize,
}

/// Counters of what the relays saw
#[derive(Default)]
pub struct Counters {
    pub links: AtomicUsize,
    pub creates: AtomicUsize,
    pub create_fasts: AtomicUsize,
    pub extends: AtomicUsize,
    pub relay_early: AtomicUsize,
    pub keepalives: AtomicUsize,
    pub destroys: AtomicUsize,
    pub ends: AtomicUsize,
    pub sendmes: AtomicUsize,
    pub introductions: AtomicUsize,
    pub resolves: AtomicUsize,
}

type CircuitKey = (u64, u16);

/// Relay-side view of one client circuit
struct SimCircuit {
    hops: Vec<Hop>,
    routers: Vec<Option<Fingerprint>>,
    splice: Option<CircuitKey>,
    /// DATA cells received per stream, for stream SENDMEs
    stream_data: HashMap<u16, u32>,
    /// DATA cells received on the circuit, for circuit SENDMEs
    circuit_data: u32,
}

impl SimCircuit {
    fn new(hop: Hop, router: Fingerprint) -> Self {
        Self {
            hops: vec![hop],
            routers: vec![Some(router)],
            splice: None,
            stream_data: HashMap::new(),
            circuit_data: 0,
        }
    }
}

#[derive(Default)]
struct SimState {
    links: HashMap<u64, mpsc::UnboundedSender<Cell>>,
    circuits: HashMap<CircuitKey, SimCircuit>,
    rendezvous: HashMap<[u8; 20], (CircuitKey, usize)>,
    intros: HashMap<[u8; 20], (CircuitKey, usize)>,
}

impl SimState {
    fn send(&self, key: CircuitKey, command: CellCommand, payload: &[u8]) {
        if let Some(link) = self.links.get(&key.0) {
            let _ = link.send(Cell::new(key.1, command, payload).unwrap());
        }
    }

    fn reply(&self, key: CircuitKey, circuit: &mut SimCircuit, hop: usize, stream_id: u16, msg: RelayMsg) {
        let mut payload = msg.into_relay_cell(stream_id).unwrap().to_payload();
        layer(&mut circuit.hops, hop, &mut payload).unwrap();
        if let Some(link) = self.links.get(&key.0) {
            let _ = link.send(Cell::with_payload(key.1, CellCommand::Relay, payload));
        }
    }

    /// Reply on a circuit that is not checked out of the table
    fn reply_to(&mut self, key: CircuitKey, hop: usize, stream_id: u16, msg: RelayMsg) {
        if let Some(mut circuit) = self.circuits.remove(&key) {
            self.reply(key, &mut circuit, hop, stream_id, msg);
            self.circuits.insert(key, circuit);
        }
    }

    /// Pass an opaque payload on to the spliced circuit
    fn forward(&mut self, to: CircuitKey, mut payload: [u8; Cell::PAYLOAD_SIZE]) {
        if let Some(mut circuit) = self.circuits.remove(&to) {
            let last = circuit.routers.iter().rposition(Option::is_some).unwrap_or(0);
            for hop in circuit.hops[..=last].iter_mut().rev() {
                hop.encrypt_forward(&mut payload);
            }
            if let Some(link) = self.links.get(&to.0) {
                let _ = link.send(Cell::with_payload(to.1, CellCommand::Relay, payload));
            }
            self.circuits.insert(to, circuit);
        }
    }

    fn destroy(&mut self, key: CircuitKey, reason: u8, notify: bool) {
        if let Some(circuit) = self.circuits.remove(&key) {
            if notify {
                self.send(key, CellCommand::Destroy, &[reason]);
            }
            if let Some(partner) = circuit.splice {
                self.destroy(partner, reason, true);
            }
        }
        self.rendezvous.retain(|_, (k, _)| *k != key);
        self.intros.retain(|_, (k, _)| *k != key);
    }
}

struct NetworkState {
    routers: HashMap<Fingerprint, Router>,
    sim: Mutex<SimState>,
    behavior: Mutex<Behavior>,
    services: Mutex<HashMap<[u8; 20], RsaPrivateKey>>,
    counters: Counters,
    next_link: AtomicU64,
}

/// The simulated network; also the transport handed to the engine
#[derive(Clone)]
pub struct MockNetwork {
    state: Arc<NetworkState>,
}

impl MockNetwork {
    pub fn new(routers: Vec<Router>) -> Self {
        Self {
            state: Arc::new(NetworkState {
                routers: routers.into_iter().map(|r| (r.fingerprint, r)).collect(),
                sim: Mutex::new(SimState::default()),
                behavior: Mutex::new(Behavior::default()),
                services: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                next_link: AtomicU64::new(1),
            }),
        }
    }

    pub fn routers(&self) -> Vec<Router> {
        let mut routers: Vec<Router> = self.state.routers.values().cloned().collect();
        routers.sort_by_key(|r| r.fingerprint);
        routers
    }

    pub fn router(&self, i: u8) -> Router {
        self.state.routers[&[i; 20]].clone()
    }

    pub fn behavior(&self) -> std::sync::MutexGuard<'_, Behavior> {
        self.state.behavior.lock().unwrap()
    }

    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }

    /// Circuits the relays currently know about
    pub fn circuit_count(&self) -> usize {
        self.state.sim.lock().unwrap().circuits.len()
    }

    /// Let the introduction points answer for `key` themselves
    pub fn host_service(&self, key: &RsaPrivateKey) {
        let pk_id = public_key_digest(&key.to_public_key()).unwrap();
        self.state.services.lock().unwrap().insert(pk_id, key.clone());
    }

    /// Every relay sends DESTROY on every circuit
    pub fn destroy_all(&self, reason: u8) {
        let mut sim = self.state.sim.lock().unwrap();
        let keys: Vec<CircuitKey> = sim.circuits.keys().copied().collect();
        for key in keys {
            sim.destroy(key, reason, true);
        }
    }

    /// The first hop of every circuit reports TRUNCATED
    pub fn truncate_all(&self, reason: u8) {
        let mut sim = self.state.sim.lock().unwrap();
        let keys: Vec<CircuitKey> = sim.circuits.keys().copied().collect();
        for key in keys {
            sim.reply_to(key, 0, 0, RelayMsg::Truncated { reason });
        }
    }

    /// The last hop of every circuit sends `msg` unprompted, `count` times
    pub fn send_unsolicited(&self, msg: RelayMsg, count: usize) {
        let mut sim = self.state.sim.lock().unwrap();
        let keys: Vec<CircuitKey> = sim.circuits.keys().copied().collect();
        for key in keys {
            let last = sim.circuits[&key].hops.len() - 1;
            for _ in 0..count {
                sim.reply_to(key, last, 0, msg.clone());
            }
        }
    }

    /// Poll until `condition` holds or two seconds pass
    pub async fn wait_until(&self, condition: impl Fn(&MockNetwork) -> bool) -> bool {
        for _ in 0..200 {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition(self)
    }

    async fn serve_link(self, link: u64, first_hop: Fingerprint, stream: DuplexStream) {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<Cell>();
        self.state.sim.lock().unwrap().links.insert(link, tx);
        tokio::spawn(async move {
            while let Some(cell) = rx.recv().await {
                if write_cell(&mut writer, &cell).await.is_err() {
                    break;
                }
            }
        });
        while let Ok(cell) = read_cell(&mut reader).await {
            self.handle_cell(link, first_hop, cell);
        }
        let mut sim = self.state.sim.lock().unwrap();
        sim.links.remove(&link);
        let keys: Vec<CircuitKey> = sim.circuits.keys().filter(|k| k.0 == link).copied().collect();
        for key in keys {
            sim.destroy(key, 8, false);
        }
    }

    fn handle_cell(&self, link: u64, first_hop: Fingerprint, cell: Cell) {
        let key = (link, cell.circuit_id);
        let mut sim = self.state.sim.lock().unwrap();
        let mut rng = rand::thread_rng();
        match cell.command {
            CellCommand::Create => {
                self.state.counters.creates.fetch_add(1, Ordering::SeqCst);
                let (reply, keys) =
                    answer_onion_skin(&mut rng, relay_key(), &cell.payload[..ONION_SKIN_LEN]).unwrap();
                sim.circuits
                    .insert(key, SimCircuit::new(Hop::new_reversed(&keys, None), first_hop));
                sim.send(key, CellCommand::Created, &reply);
            }
            CellCommand::CreateFast => {
                self.state.counters.create_fasts.fetch_add(1, Ordering::SeqCst);
                let (reply, keys) = fast_respond(&mut rng, &cell.payload[..FAST_KEY_LEN]).unwrap();
                sim.circuits
                    .insert(key, SimCircuit::new(Hop::new_reversed(&keys, None), first_hop));
                sim.send(key, CellCommand::CreatedFast, &reply);
            }
            CellCommand::Destroy => {
                self.state.counters.destroys.fetch_add(1, Ordering::SeqCst);
                sim.destroy(key, cell.payload[0], false);
            }
            CellCommand::Relay | CellCommand::RelayEarly => {
                if cell.command == CellCommand::RelayEarly {
                    self.state.counters.relay_early.fetch_add(1, Ordering::SeqCst);
                }
                let Some(mut circuit) = sim.circuits.remove(&key) else {
                    return;
                };
                let mut payload = cell.payload;
                match peel(&mut circuit.hops, &mut payload) {
                    Ok(hop) => {
                        let relay = RelayCell::from_payload(&payload).unwrap();
                        let msg = RelayMsg::decode(&relay).unwrap();
                        let keep = self.handle_relay(&mut sim, key, &mut circuit, hop, relay.stream_id, msg);
                        if keep {
                            sim.circuits.insert(key, circuit);
                        }
                    }
                    Err(_) => match circuit.splice {
                        Some(partner) => {
                            sim.circuits.insert(key, circuit);
                            sim.forward(partner, payload);
                        }
                        None => {
                            sim.circuits.insert(key, circuit);
                            sim.destroy(key, 1, true);
                        }
                    },
                }
            }
            _ => {}
        }
    }

    /// Act on a recognized relay message; `false` drops the circuit
    fn handle_relay(
        &self,
        sim: &mut SimState,
        key: CircuitKey,
        circuit: &mut SimCircuit,
        hop: usize,
        stream_id: u16,
        msg: RelayMsg,
    ) -> bool {
        let counters = &self.state.counters;
        let router = circuit.routers[hop].and_then(|fp| self.state.routers.get(&fp).cloned());
        let mut rng = rand::thread_rng();
        match msg {
            RelayMsg::Extend {
                onion_skin, identity, ..
            } => {
                counters.extends.fetch_add(1, Ordering::SeqCst);
                let behavior = self.state.behavior.lock().unwrap();
                if behavior.silent_extend.contains(&identity) {
                    return true;
                }
                if behavior.unreachable.contains(&identity) || !self.state.routers.contains_key(&identity) {
                    sim.reply(key, circuit, hop, 0, RelayMsg::Truncated { reason: 6 });
                    return true;
                }
                let (reply, keys) = answer_onion_skin(&mut rng, relay_key(), &onion_skin).unwrap();
                circuit.hops.push(Hop::new_reversed(&keys, None));
                circuit.routers.push(Some(identity));
                sim.reply(key, circuit, hop, 0, RelayMsg::Extended { reply });
            }
            RelayMsg::Begin { port, .. } => {
                let allowed = match &router {
                    Some(r) => r.exit_policy.allows(port),
                    // The simulated hidden service serves every port but 81
                    None => port != 81,
                };
                let answer = if allowed {
                    circuit.stream_data.insert(stream_id, 0);
                    RelayMsg::Connected {
                        address: router.as_ref().map(|_| EXIT_ADDRESS),
                        ttl: router.as_ref().map(|_| 300),
                    }
                } else {
                    RelayMsg::End {
                        reason: end_reason::EXITPOLICY,
                    }
                };
                sim.reply(key, circuit, hop, stream_id, answer);
            }
            RelayMsg::BeginDir => {
                circuit.stream_data.insert(stream_id, 0);
                sim.reply(key, circuit, hop, stream_id, RelayMsg::Connected { address: None, ttl: None });
            }
            RelayMsg::Data(data) => {
                circuit.circuit_data += 1;
                if circuit.circuit_data % 100 == 0 {
                    sim.reply(key, circuit, hop, 0, RelayMsg::Sendme);
                }
                let Some(count) = circuit.stream_data.get_mut(&stream_id) else {
                    return true;
                };
                *count += 1;
                let stream_sendme = *count % 50 == 0;
                if stream_sendme {
                    sim.reply(key, circuit, hop, stream_id, RelayMsg::Sendme);
                }
                let close = data == CLOSE_AFTER_ECHO;
                sim.reply(key, circuit, hop, stream_id, RelayMsg::Data(data));
                if close {
                    circuit.stream_data.remove(&stream_id);
                    sim.reply(key, circuit, hop, stream_id, RelayMsg::End { reason: end_reason::DONE });
                }
            }
            RelayMsg::End { .. } => {
                counters.ends.fetch_add(1, Ordering::SeqCst);
                circuit.stream_data.remove(&stream_id);
            }
            RelayMsg::Sendme => {
                counters.sendmes.fetch_add(1, Ordering::SeqCst);
            }
            RelayMsg::Drop => {
                counters.keepalives.fetch_add(1, Ordering::SeqCst);
            }
            RelayMsg::Resolve { hostname } => {
                counters.resolves.fetch_add(1, Ordering::SeqCst);
                let failing = {
                    let mut behavior = self.state.behavior.lock().unwrap();
                    let failing = behavior.failing_resolves > 0;
                    behavior.failing_resolves = behavior.failing_resolves.saturating_sub(1);
                    failing
                };
                let answer = if failing {
                    ResolvedAnswer::Error { transient: true, ttl: 0 }
                } else if hostname == UNRESOLVABLE {
                    ResolvedAnswer::Error { transient: false, ttl: 0 }
                } else {
                    ResolvedAnswer::Address {
                        addr: IpAddr::V4(EXIT_ADDRESS),
                        ttl: 60,
                    }
                };
                sim.reply(key, circuit, hop, stream_id, RelayMsg::Resolved(vec![answer]));
            }
            RelayMsg::EstablishRendezvous { cookie } => {
                sim.rendezvous.insert(cookie, (key, hop));
                sim.reply(key, circuit, hop, 0, RelayMsg::RendezvousEstablished);
            }
            RelayMsg::EstablishIntro {
                service_key_der,
                handshake_auth,
                signature,
            } => {
                let mut input = circuit.hops[hop].kh().to_vec();
                input.extend_from_slice(b"INTRODUCE");
                let service_key = <RsaPublicKey as rsa::pkcs1::DecodeRsaPublicKey>::from_pkcs1_der(&service_key_der);
                let digest = sha1(&establish_intro_signed_part(&service_key_der, &handshake_auth));
                let valid = sha1(&input) == handshake_auth
                    && service_key
                        .map(|k| k.verify(Pkcs1v15Sign::new_unprefixed(), &digest, &signature).is_ok())
                        .unwrap_or(false);
                if !valid {
                    return false;
                }
                sim.intros.insert(sha1(&service_key_der), (key, hop));
                sim.reply(key, circuit, hop, 0, RelayMsg::IntroEstablished);
            }
            RelayMsg::Introduce1 { pk_id, encrypted } => {
                counters.introductions.fetch_add(1, Ordering::SeqCst);
                let fingerprint = circuit.routers[hop].unwrap_or_default();
                {
                    let behavior = self.state.behavior.lock().unwrap();
                    if behavior.silent_intro.contains(&fingerprint) {
                        return true;
                    }
                    if behavior.nack_intro.contains(&fingerprint) {
                        sim.reply(key, circuit, hop, 0, RelayMsg::IntroduceAck { accepted: false });
                        return true;
                    }
                }
                let accepted = if let Some((service, service_hop)) = sim.intros.get(&pk_id).copied() {
                    sim.reply_to(service, service_hop, 0, RelayMsg::Introduce2 { pk_id, encrypted });
                    true
                } else {
                    self.answer_as_service(sim, pk_id, &encrypted)
                };
                sim.reply(key, circuit, hop, 0, RelayMsg::IntroduceAck { accepted });
            }
            RelayMsg::Rendezvous1 { cookie, reply } => {
                let Some((client, client_hop)) = sim.rendezvous.remove(&cookie) else {
                    return false;
                };
                sim.reply_to(client, client_hop, 0, RelayMsg::Rendezvous2 { reply });
                if let Some(client_circuit) = sim.circuits.get_mut(&client) {
                    client_circuit.splice = Some(key);
                }
                circuit.splice = Some(client);
            }
            _ => {}
        }
        true
    }

    /// Play a hosted service: answer the introduction at the rendezvous point
    fn answer_as_service(&self, sim: &mut SimState, pk_id: [u8; 20], encrypted: &[u8]) -> bool {
        let Some(key) = self.state.services.lock().unwrap().get(&pk_id).cloned() else {
            return false;
        };
        let Ok(plaintext) = asym_decrypt(&key, encrypted) else {
            return false;
        };
        let Ok(request) = IntroducePayload::decode(&plaintext) else {
            return false;
        };
        let Some((client, client_hop)) = sim.rendezvous.remove(&request.cookie) else {
            return false;
        };
        let (reply, keys) = dh_respond(&mut rand::thread_rng(), &request.dh_public).unwrap();
        sim.reply_to(client, client_hop, 0, RelayMsg::Rendezvous2 { reply });
        if let Some(circuit) = sim.circuits.get_mut(&client) {
            circuit.hops.push(Hop::new_reversed(&keys, None));
            circuit.routers.push(None);
        }
        true
    }
}

#[async_trait]
impl Transport for MockNetwork {
    async fn connect(&self, router: &Router) -> Result<Box<dyn TransportStream>> {
        let refused = self.behavior().refuse_links.contains(&router.fingerprint);
        if refused {
            return Err(TorError::ConnectionFailed(format!("{} refused", router.nickname)));
        }
        let (near, far) = tokio::io::duplex(1 << 20);
        let link = self.state.next_link.fetch_add(1, Ordering::SeqCst);
        self.state.counters.links.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(self.clone().serve_link(link, router.fingerprint, far));
        Ok(Box::new(near))
    }
}

/// Directory over a fixed router list; stores published descriptors
pub struct MockDirectory {
    routers: Vec<Router>,
    descriptors: Mutex<HashMap<String, RendezvousServiceDescriptor>>,
    ready: AtomicBool,
}

impl MockDirectory {
    pub fn new(routers: Vec<Router>) -> Self {
        Self {
            routers,
            descriptors: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(true),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn add_descriptor(&self, descriptor: RendezvousServiceDescriptor) {
        let id = descriptor.onion_id().unwrap();
        self.descriptors.lock().unwrap().insert(id, descriptor);
    }

    pub fn has_descriptor(&self, onion_id: &str) -> bool {
        self.descriptors.lock().unwrap().contains_key(onion_id)
    }
}

#[async_trait]
impl Directory for MockDirectory {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn valid_routers(&self) -> Result<Vec<Router>> {
        Ok(self.routers.clone())
    }

    async fn service_descriptor(&self, onion_id: &str) -> Result<RendezvousServiceDescriptor> {
        self.descriptors
            .lock()
            .unwrap()
            .get(onion_id)
            .cloned()
            .ok_or_else(|| TorError::Directory(format!("No descriptor for {}", onion_id)))
    }

    async fn publish_descriptor(&self, descriptor: RendezvousServiceDescriptor) -> Result<()> {
        self.add_descriptor(descriptor);
        Ok(())
    }
}

/// Network plus directory over the default routers
pub fn default_network() -> (MockNetwork, Arc<MockDirectory>) {
    let routers = default_routers();
    (MockNetwork::new(routers.clone()), Arc::new(MockDirectory::new(routers)))
}
