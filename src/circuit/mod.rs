//! Circuits
//!
//! A [`Circuit`] owns its hop list, its stream table and a reactor task
//! that reads the circuit's cells off the shared connection. The reactor
//! peels every relay cell, handles flow control and stream traffic
//! itself, and forwards circuit-level control messages (EXTENDED,
//! RENDEZVOUS2, ...) to whoever is waiting through [`Circuit::wait_event`].
//!
//! Outgoing cells are layered and queued on the connection while holding
//! the hop lock, so the order of forward digests always matches the order
//! of cells on the wire.

mod builder;
mod stream;

pub use builder::CircuitBuilder;
pub use stream::{Stream, StreamTarget};

use crate::config::{Settings, MAX_ROUTE_LENGTH};
use crate::connection_pool::Connection;
use crate::error::{destroy_reason_name, Result, TorError};
use crate::protocol::{
    end_reason, layer, peel, Cell, CellCommand, CircuitFlowControl, CircuitId, Hop, RelayCell,
    RelayMsg, ResolvedAnswer, Router, StreamFlowControl, StreamId,
};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// DESTROY reason codes used by the client
pub mod destroy_reason {
    pub const NONE: u8 = 0;
    pub const PROTOCOL: u8 = 1;
    pub const INTERNAL: u8 = 2;
    pub const REQUESTED: u8 = 3;
    pub const FINISHED: u8 = 9;
    pub const TIMEOUT: u8 = 10;
}

/// RELAY_EARLY cells a circuit may send
const MAX_RELAY_EARLY: usize = 8;

/// Control events held for waiters; later strays are dropped
const MAX_QUEUED_EVENTS: usize = 32;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Handshaking with the hop at this index
    Building(usize),
    Established,
    Closing,
    Destroyed,
}

/// Control traffic handed to waiters
#[derive(Debug)]
pub enum CircuitEvent {
    /// CREATED or CREATED_FAST body
    Created { command: CellCommand, payload: Vec<u8> },
    /// Circuit-level relay message and the hop it came from
    Relay { hop: usize, msg: RelayMsg },
}

/// Traffic for one stream
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Connected,
    Data(Vec<u8>),
    End(u8),
    Resolved(Vec<ResolvedAnswer>),
}

struct StreamEntry {
    tx: mpsc::UnboundedSender<StreamEvent>,
    flow: Arc<StreamFlowControl>,
    hop: usize,
    established: bool,
    remote_ended: bool,
    opened_at: Instant,
}

#[derive(Default)]
struct StreamTable {
    entries: BTreeMap<StreamId, StreamEntry>,
    next_id: StreamId,
}

impl StreamTable {
    /// Next free stream id, sequential and never 0
    fn allocate(&mut self) -> Option<StreamId> {
        for _ in 0..u16::MAX {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if !self.entries.contains_key(&self.next_id) {
                return Some(self.next_id);
            }
        }
        None
    }
}

/// A stream opened by the far end (hidden-service side)
pub struct IncomingStream {
    /// Port the client asked for
    pub port: u16,
    pub stream: Stream,
}

/// One circuit over one connection
pub struct Circuit {
    serial: u64,
    id: CircuitId,
    connection: Arc<Connection>,
    settings: Arc<Settings>,
    target_len: AtomicUsize,
    state: Mutex<CircuitState>,
    hops: Mutex<Vec<Hop>>,
    streams: Mutex<StreamTable>,
    events_tx: mpsc::Sender<CircuitEvent>,
    events: tokio::sync::Mutex<mpsc::Receiver<CircuitEvent>>,
    destroyed_by: Mutex<Option<TorError>>,
    flow: CircuitFlowControl,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    /// Last cell that was not padding
    last_traffic: Mutex<Instant>,
    dirty_since: Mutex<Option<Instant>>,
    exclusive: AtomicBool,
    close_on_last_stream: AtomicBool,
    relay_early_sent: AtomicUsize,
    incoming: Mutex<Option<mpsc::UnboundedSender<IncomingStream>>>,
    reactor: Mutex<Option<JoinHandle<()>>>,
    /// Wakes event waiters on teardown
    closed: Notify,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| TorError::Internal(format!("{} lock poisoned", what)))
}

impl Circuit {
    /// Wrap a freshly allocated circuit id and start its reactor
    pub(crate) fn start(
        id: CircuitId,
        connection: Arc<Connection>,
        inbound: mpsc::UnboundedReceiver<Cell>,
        settings: Arc<Settings>,
        target_len: usize,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(MAX_QUEUED_EVENTS);
        let now = Instant::now();
        let circuit = Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            id,
            connection,
            flow: CircuitFlowControl::new(&settings),
            settings,
            target_len: AtomicUsize::new(target_len),
            state: Mutex::new(CircuitState::Building(0)),
            hops: Mutex::new(Vec::with_capacity(target_len + 1)),
            streams: Mutex::new(StreamTable::default()),
            events_tx,
            events: tokio::sync::Mutex::new(events_rx),
            destroyed_by: Mutex::new(None),
            created_at: now,
            last_activity: Mutex::new(now),
            last_traffic: Mutex::new(now),
            dirty_since: Mutex::new(None),
            exclusive: AtomicBool::new(false),
            close_on_last_stream: AtomicBool::new(false),
            relay_early_sent: AtomicUsize::new(0),
            incoming: Mutex::new(None),
            reactor: Mutex::new(None),
            closed: Notify::new(),
        });

        let task = tokio::spawn(Self::run_reactor(Arc::downgrade(&circuit), inbound));
        if let Ok(mut reactor) = circuit.reactor.lock() {
            *reactor = Some(task);
        }
        circuit
    }

    async fn run_reactor(weak: Weak<Circuit>, mut inbound: mpsc::UnboundedReceiver<Cell>) {
        while let Some(cell) = inbound.recv().await {
            let Some(circuit) = weak.upgrade() else {
                return;
            };
            if let Err(e) = circuit.handle_cell(cell) {
                log::warn!("⚠️ Circuit {} failed: {}", circuit.serial, e);
                let reason = if e.is_fatal_to_circuit() {
                    destroy_reason::PROTOCOL
                } else {
                    destroy_reason::INTERNAL
                };
                circuit.teardown(Some(reason), e);
            }
            if circuit.is_destroyed() {
                return;
            }
        }
        if let Some(circuit) = weak.upgrade() {
            circuit.teardown(
                None,
                TorError::ConnectionClosed(format!(
                    "Link to {} went away",
                    circuit.connection.router().nickname
                )),
            );
        }
    }

    fn handle_cell(self: &Arc<Self>, cell: Cell) -> Result<()> {
        match cell.command {
            CellCommand::Created | CellCommand::CreatedFast => {
                self.post_event(CircuitEvent::Created {
                    command: cell.command,
                    payload: cell.payload.to_vec(),
                });
                Ok(())
            }
            CellCommand::Destroy => {
                let reason = cell.payload[0];
                log::info!(
                    "💥 Circuit {} destroyed by relay: {}",
                    self.serial,
                    destroy_reason_name(reason)
                );
                self.teardown(None, TorError::circuit_destroyed(reason));
                Ok(())
            }
            CellCommand::Relay | CellCommand::RelayEarly => self.handle_relay(cell.payload),
            CellCommand::Padding => Ok(()),
            CellCommand::Create | CellCommand::CreateFast => Err(TorError::ProtocolError(format!(
                "Relay sent {:?} to a client",
                cell.command
            ))),
        }
    }

    fn handle_relay(self: &Arc<Self>, mut payload: [u8; Cell::PAYLOAD_SIZE]) -> Result<()> {
        let hop = {
            let mut hops = lock(&self.hops, "Hop")?;
            peel(&mut hops, &mut payload)?
        };
        let cell = RelayCell::from_payload(&payload)?;
        let msg = RelayMsg::decode(&cell)?;
        self.touch(!matches!(msg, RelayMsg::Drop));
        log::trace!(
            "Circuit {}: {:?} from hop {} on stream {}",
            self.serial,
            cell.command,
            hop,
            cell.stream_id
        );

        if cell.stream_id == 0 {
            return self.handle_circuit_msg(hop, msg);
        }
        self.handle_stream_msg(hop, cell.stream_id, msg)
    }

    fn handle_circuit_msg(&self, hop: usize, msg: RelayMsg) -> Result<()> {
        match msg {
            RelayMsg::Sendme => {
                self.flow.send.on_sendme_received();
                Ok(())
            }
            RelayMsg::Drop => Ok(()),
            RelayMsg::Truncated { reason } => {
                log::info!(
                    "✂️ Circuit {} truncated at hop {}: {}",
                    self.serial,
                    hop,
                    destroy_reason_name(reason)
                );
                self.teardown(
                    Some(destroy_reason::FINISHED),
                    TorError::circuit_destroyed(reason),
                );
                Ok(())
            }
            RelayMsg::Data(_)
            | RelayMsg::Begin { .. }
            | RelayMsg::BeginDir
            | RelayMsg::Connected { .. }
            | RelayMsg::End { .. }
            | RelayMsg::Resolved(_) => Err(TorError::ProtocolError(format!(
                "{:?} without a stream id",
                msg.command()
            ))),
            other => {
                self.post_event(CircuitEvent::Relay { hop, msg: other });
                Ok(())
            }
        }
    }

    fn post_event(&self, event: CircuitEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events_tx.try_send(event) {
            log::debug!("Circuit {}: nobody waiting, dropping {:?}", self.serial, event);
        }
    }

    /// Control events queued for the next [`wait_event`](Self::wait_event)
    pub fn queued_events(&self) -> usize {
        self.events_tx.max_capacity() - self.events_tx.capacity()
    }

    fn handle_stream_msg(self: &Arc<Self>, hop: usize, stream_id: StreamId, msg: RelayMsg) -> Result<()> {
        if let RelayMsg::Begin { port, .. } = &msg {
            return self.handle_incoming_begin(hop, stream_id, *port);
        }
        if let RelayMsg::BeginDir = &msg {
            return self.send_relay(
                hop,
                RelayMsg::End {
                    reason: end_reason::NOTDIRECTORY,
                },
                stream_id,
            );
        }
        if let RelayMsg::Data(_) = &msg {
            if self.flow.on_receive_data() {
                self.send_relay(hop, RelayMsg::Sendme, 0)?;
            }
        }

        let mut stream_sendme = false;
        {
            let mut streams = lock(&self.streams, "Stream table")?;
            let Some(entry) = streams.entries.get_mut(&stream_id) else {
                log::debug!(
                    "Circuit {}: {:?} for unknown stream {}",
                    self.serial,
                    msg.command(),
                    stream_id
                );
                return Ok(());
            };
            if entry.hop != hop {
                return Err(TorError::ProtocolError(format!(
                    "Stream {} traffic from hop {} instead of {}",
                    stream_id, hop, entry.hop
                )));
            }
            let event = match msg {
                RelayMsg::Sendme => {
                    entry.flow.send.on_sendme_received();
                    None
                }
                RelayMsg::Connected { .. } => {
                    entry.established = true;
                    Some(StreamEvent::Connected)
                }
                RelayMsg::Data(data) => {
                    stream_sendme = entry.flow.on_receive_data();
                    Some(StreamEvent::Data(data))
                }
                RelayMsg::End { reason } => {
                    entry.remote_ended = true;
                    entry.flow.send.close();
                    Some(StreamEvent::End(reason))
                }
                RelayMsg::Resolved(answers) => Some(StreamEvent::Resolved(answers)),
                other => {
                    return Err(TorError::ProtocolError(format!(
                        "Unexpected {:?} on stream {}",
                        other.command(),
                        stream_id
                    )))
                }
            };
            if let Some(event) = event {
                let _ = entry.tx.send(event);
            }
        }

        if stream_sendme {
            self.send_relay(hop, RelayMsg::Sendme, stream_id)?;
        }
        Ok(())
    }

    fn handle_incoming_begin(self: &Arc<Self>, hop: usize, stream_id: StreamId, port: u16) -> Result<()> {
        let handler = lock(&self.incoming, "Incoming handler")?.clone();
        let Some(handler) = handler else {
            log::debug!("Circuit {}: refusing BEGIN, not serving streams", self.serial);
            return self.send_relay(
                hop,
                RelayMsg::End {
                    reason: end_reason::EXITPOLICY,
                },
                stream_id,
            );
        };
        let stream = self.register_stream(stream_id, hop, true)?;
        log::info!("📥 Incoming stream {} for port {}", stream_id, port);
        if handler.send(IncomingStream { port, stream }).is_err() {
            log::debug!("Incoming stream handler is gone");
        }
        Ok(())
    }

    /// Circuit id on its connection
    pub fn id(&self) -> CircuitId {
        self.id
    }

    /// Process-unique number, for logs and bookkeeping
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> CircuitState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(CircuitState::Destroyed)
    }

    pub fn is_established(&self) -> bool {
        self.state() == CircuitState::Established
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == CircuitState::Destroyed
    }

    /// Hops whose handshake completed (virtual hop included)
    pub fn route_established(&self) -> usize {
        self.hops.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Route length this circuit was built for
    pub fn target_len(&self) -> usize {
        self.target_len.load(Ordering::SeqCst)
    }

    /// Index of the last hop
    pub fn last_hop(&self) -> Result<usize> {
        self.route_established()
            .checked_sub(1)
            .ok_or_else(|| TorError::Internal("Circuit has no hops".into()))
    }

    /// Router at hop `index`, if it is a real router
    pub fn hop_router(&self, index: usize) -> Option<Router> {
        let hops = self.hops.lock().ok()?;
        hops.get(index).and_then(|h| h.router().cloned())
    }

    /// KH of the handshake with hop `index`
    pub fn hop_kh(&self, index: usize) -> Option<[u8; 20]> {
        let hops = self.hops.lock().ok()?;
        hops.get(index).map(|h| *h.kh())
    }

    pub fn has_virtual_hop(&self) -> bool {
        self.hops
            .lock()
            .map(|h| h.iter().any(Hop::is_virtual))
            .unwrap_or(false)
    }

    /// Whether the last hop may carry traffic to `port`
    pub fn allows_exit_port(&self, port: u16) -> bool {
        let Ok(last) = self.last_hop() else {
            return false;
        };
        self.hop_router(last)
            .map(|r| r.is_exit_for(port))
            .unwrap_or(false)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Established, open for new streams and below the stream ceiling
    pub fn has_capacity(&self) -> bool {
        self.is_established() && self.stream_count() < self.settings.streams_per_circuit
    }

    /// Exclusive circuits are never handed out for general traffic
    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::SeqCst)
    }

    pub fn set_exclusive(&self, exclusive: bool) {
        self.exclusive.store(exclusive, Ordering::SeqCst);
    }

    /// Destroy the circuit once its last stream is gone
    pub fn set_close_on_last_stream(&self, close: bool) {
        self.close_on_last_stream.store(close, Ordering::SeqCst);
    }

    /// Whether the circuit has carried a stream
    pub fn is_dirty(&self) -> bool {
        self.dirty_since.lock().map(|d| d.is_some()).unwrap_or(true)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last cell in either direction
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Time since the last cell other than RELAY_DROP padding
    pub fn traffic_idle_for(&self) -> Duration {
        self.last_traffic
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    /// Record a cell; padding does not count as traffic
    fn touch(&self, traffic: bool) {
        let now = Instant::now();
        if let Ok(mut t) = self.last_activity.lock() {
            *t = now;
        }
        if traffic {
            if let Ok(mut t) = self.last_traffic.lock() {
                *t = now;
            }
        }
    }

    fn mark_dirty(&self) {
        if let Ok(mut dirty) = self.dirty_since.lock() {
            dirty.get_or_insert_with(Instant::now);
        }
    }

    pub(crate) fn set_building(&self, hop: usize) -> Result<()> {
        let mut state = lock(&self.state, "State")?;
        match *state {
            CircuitState::Building(_) => {
                *state = CircuitState::Building(hop);
                Ok(())
            }
            other => Err(TorError::CircuitBuildFailed(format!(
                "Circuit {} is {:?}",
                self.serial, other
            ))),
        }
    }

    /// Move to `Established`; requires every hop of the route
    pub(crate) fn set_established(&self) -> Result<()> {
        let mut state = lock(&self.state, "State")?;
        if !matches!(*state, CircuitState::Building(_)) {
            return Err(self.current_failure().unwrap_or_else(|| {
                TorError::CircuitBuildFailed(format!("Circuit {} is {:?}", self.serial, *state))
            }));
        }
        let established = self.route_established();
        if established != self.target_len() {
            return Err(TorError::CircuitBuildFailed(format!(
                "Only {} of {} hops established",
                established,
                self.target_len()
            )));
        }
        *state = CircuitState::Established;
        Ok(())
    }

    /// Append a hop whose handshake just completed
    pub(crate) fn push_hop(&self, hop: Hop) -> Result<()> {
        let mut hops = lock(&self.hops, "Hop")?;
        if hops.len() >= self.target_len() {
            return Err(TorError::Internal(format!(
                "Route already has its {} hops",
                hops.len()
            )));
        }
        hops.push(hop);
        Ok(())
    }

    /// Append the rendezvous virtual hop; allowed once, on an established circuit
    pub fn attach_virtual_hop(&self, hop: Hop) -> Result<()> {
        if !self.is_established() {
            return Err(TorError::CircuitBuildFailed(
                "Virtual hop needs an established circuit".into(),
            ));
        }
        let mut hops = lock(&self.hops, "Hop")?;
        if hops.iter().any(Hop::is_virtual) {
            return Err(TorError::ProtocolError("Virtual hop already attached".into()));
        }
        if hops.len() >= MAX_ROUTE_LENGTH + 1 {
            return Err(TorError::ProtocolError("Route too long for a virtual hop".into()));
        }
        hops.push(hop);
        self.target_len.fetch_add(1, Ordering::SeqCst);
        log::info!(
            "🔗 Circuit {} joined with rendezvous peer ({} hops)",
            self.serial,
            hops.len()
        );
        Ok(())
    }

    /// Send a non-relay cell on this circuit (CREATE, CREATE_FAST)
    pub(crate) fn send_cell(&self, command: CellCommand, payload: &[u8]) -> Result<()> {
        let cell = Cell::new(self.id, command, payload)?;
        self.connection.send(cell)?;
        self.touch(true);
        Ok(())
    }

    fn send_relay_with(
        &self,
        command: CellCommand,
        hop: usize,
        msg: RelayMsg,
        stream_id: StreamId,
    ) -> Result<()> {
        if self.is_destroyed() {
            return Err(self.destroyed_error());
        }
        let traffic = !matches!(msg, RelayMsg::Drop);
        let relay = msg.into_relay_cell(stream_id)?;
        let mut payload = relay.to_payload();
        {
            let mut hops = lock(&self.hops, "Hop")?;
            layer(&mut hops, hop, &mut payload)?;
            // Queue while still holding the lock: digest order is wire order
            self.connection
                .send(Cell::with_payload(self.id, command, payload))?;
        }
        self.touch(traffic);
        Ok(())
    }

    /// Send a relay message to hop `hop`
    pub fn send_relay(&self, hop: usize, msg: RelayMsg, stream_id: StreamId) -> Result<()> {
        self.send_relay_with(CellCommand::Relay, hop, msg, stream_id)
    }

    /// Send a relay message as RELAY_EARLY (EXTEND must use this)
    pub(crate) fn send_relay_early(&self, hop: usize, msg: RelayMsg) -> Result<()> {
        if self.relay_early_sent.fetch_add(1, Ordering::SeqCst) >= MAX_RELAY_EARLY {
            return Err(TorError::ProtocolError("RELAY_EARLY budget exhausted".into()));
        }
        self.send_relay_with(CellCommand::RelayEarly, hop, msg, 0)
    }

    /// Send a circuit-level message to the last hop
    pub fn send_to_last_hop(&self, msg: RelayMsg) -> Result<()> {
        let hop = self.last_hop()?;
        self.send_relay(hop, msg, 0)
    }

    /// Send a RELAY_DROP to the last hop so the circuit is not idle
    pub fn send_keepalive(&self) -> Result<()> {
        log::trace!("Keepalive on circuit {}", self.serial);
        self.send_to_last_hop(RelayMsg::Drop)
    }

    /// Wait for the next control event that `pick` accepts
    ///
    /// Events `pick` declines are dropped. Fails with whatever destroyed the
    /// circuit, or with `on_timeout()` once `wait` has passed.
    pub async fn wait_event<T, P, E>(&self, wait: Duration, mut pick: P, on_timeout: E) -> Result<T>
    where
        P: FnMut(CircuitEvent) -> Option<Result<T>>,
        E: FnOnce() -> TorError,
    {
        let deadline = Instant::now() + wait;
        let mut events = self.events.lock().await;
        loop {
            let closed = self.closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if let Some(err) = self.current_failure() {
                return Err(err);
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Err(on_timeout()),
                _ = &mut closed => continue,
                event = events.recv() => match event {
                    None => return Err(self.destroyed_error()),
                    Some(event) => {
                        if let Some(result) = pick(event) {
                            return result;
                        }
                    }
                },
            }
        }
    }

    fn current_failure(&self) -> Option<TorError> {
        if self.is_destroyed() {
            Some(self.destroyed_error())
        } else {
            None
        }
    }

    fn destroyed_error(&self) -> TorError {
        self.destroyed_by
            .lock()
            .ok()
            .and_then(|e| e.clone())
            .unwrap_or_else(|| TorError::circuit_destroyed(destroy_reason::NONE))
    }

    /// Register a stream entry and hand back its handle
    fn register_stream(self: &Arc<Self>, id: StreamId, hop: usize, established: bool) -> Result<Stream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = Arc::new(StreamFlowControl::new(id, &self.settings));
        {
            let mut streams = lock(&self.streams, "Stream table")?;
            if streams.entries.contains_key(&id) {
                return Err(TorError::ProtocolError(format!("Stream {} already open", id)));
            }
            streams.entries.insert(
                id,
                StreamEntry {
                    tx,
                    flow: flow.clone(),
                    hop,
                    established,
                    remote_ended: false,
                    opened_at: Instant::now(),
                },
            );
        }
        self.mark_dirty();
        Ok(Stream::new(id, self.clone(), hop, rx, flow, established))
    }

    fn reserve_stream(self: &Arc<Self>) -> Result<Stream> {
        if !self.is_established() {
            return Err(TorError::NoUsableCircuit(format!(
                "Circuit {} is {:?}",
                self.serial,
                self.state()
            )));
        }
        if self.stream_count() >= self.settings.streams_per_circuit {
            return Err(TorError::NoUsableCircuit(format!(
                "Circuit {} carries its maximum of {} streams",
                self.serial, self.settings.streams_per_circuit
            )));
        }
        let id = lock(&self.streams, "Stream table")?
            .allocate()
            .ok_or_else(|| TorError::NoUsableCircuit("No free stream id".into()))?;
        let hop = self.last_hop()?;
        self.register_stream(id, hop, false)
    }

    /// Open a stream and wait for RELAY_CONNECTED
    pub async fn open_stream(self: &Arc<Self>, target: StreamTarget) -> Result<Stream> {
        let mut stream = self.reserve_stream()?;
        let msg = target.begin_msg();
        log::debug!(
            "🌊 Opening stream {} on circuit {} to {}",
            stream.id(),
            self.serial,
            target
        );
        self.send_relay(stream.hop(), msg, stream.id())?;
        stream.wait_connected(self.settings.stream_open_timeout()).await?;
        log::info!("✅ Stream {} open to {}", stream.id(), target);
        Ok(stream)
    }

    /// Resolve a hostname at the exit
    pub async fn resolve(self: &Arc<Self>, hostname: &str) -> Result<Vec<IpAddr>> {
        let mut stream = self.reserve_stream()?;
        self.send_relay(
            stream.hop(),
            RelayMsg::Resolve {
                hostname: hostname.to_string(),
            },
            stream.id(),
        )?;
        let answers = stream.wait_resolved(self.settings.resolve_timeout()).await?;
        let addrs: Vec<IpAddr> = answers
            .iter()
            .filter_map(|a| match a {
                ResolvedAnswer::Address { addr, .. } => Some(*addr),
                ResolvedAnswer::Error { .. } => None,
            })
            .collect();
        if addrs.is_empty() {
            return Err(TorError::Stream(format!("Could not resolve {}", hostname)));
        }
        Ok(addrs)
    }

    /// Deliver incoming BEGINs to `handler` from now on
    pub fn serve_streams(&self, handler: mpsc::UnboundedSender<IncomingStream>) {
        if let Ok(mut incoming) = self.incoming.lock() {
            *incoming = Some(handler);
        }
    }

    /// Send END for a stream (unless the peer ended it first) and forget it
    ///
    /// END closes both directions; cells still in flight for the stream
    /// are dropped as unknown.
    pub(crate) fn end_stream(&self, stream_id: StreamId, reason: u8) {
        let (hop, send_end) = {
            let Ok(mut streams) = self.streams.lock() else {
                return;
            };
            let Some(entry) = streams.entries.remove(&stream_id) else {
                return;
            };
            entry.flow.send.close();
            (entry.hop, !entry.remote_ended)
        };
        if send_end && !self.is_destroyed() {
            if let Err(e) = self.send_relay(hop, RelayMsg::End { reason }, stream_id) {
                log::debug!("Could not send END for stream {}: {}", stream_id, e);
            }
        }
        self.after_stream_removed();
    }

    /// Wait for window space on both the stream and the circuit
    pub(crate) async fn reserve_data_cell(&self, stream_flow: &StreamFlowControl) -> Result<()> {
        stream_flow
            .reserve_cell(&self.flow.send, self.settings.stream_open_timeout())
            .await
    }

    fn after_stream_removed(&self) {
        if self.close_on_last_stream.load(Ordering::SeqCst) && self.stream_count() == 0 {
            log::debug!("Circuit {} lost its last stream, closing", self.serial);
            self.destroy(destroy_reason::FINISHED);
        }
    }

    /// Drop streams that were never connected within `max_age`; returns how many
    pub fn expire_pending_streams(&self, max_age: Duration) -> usize {
        let expired: Vec<StreamId> = match self.streams.lock() {
            Ok(streams) => streams
                .entries
                .iter()
                .filter(|(_, e)| !e.established && e.opened_at.elapsed() > max_age)
                .map(|(id, _)| *id)
                .collect(),
            Err(_) => return 0,
        };
        for id in &expired {
            log::debug!("⏰ Stream {} never connected, closing", id);
            self.end_stream(*id, end_reason::TIMEOUT);
        }
        expired.len()
    }

    /// Tear the circuit down and tell the relay
    pub fn destroy(&self, reason: u8) {
        self.teardown(
            Some(reason),
            TorError::CircuitDestroyed {
                reason,
                reason_name: format!("closed locally ({})", destroy_reason_name(reason)),
            },
        );
    }

    /// Release all state; `send_destroy` carries the reason to send, if any
    fn teardown(&self, send_destroy: Option<u8>, cause: TorError) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if matches!(*state, CircuitState::Destroyed | CircuitState::Closing) {
                return;
            }
            *state = CircuitState::Closing;
        }
        if let Some(reason) = send_destroy {
            let _ = self.connection.send(Cell::destroy(self.id, reason));
        }
        self.connection.remove_circuit(self.id);

        if let Ok(mut slot) = self.destroyed_by.lock() {
            *slot = Some(cause);
        }
        if let Ok(mut state) = self.state.lock() {
            *state = CircuitState::Destroyed;
        }
        self.closed.notify_waiters();

        // Streams see END(DESTROY), then their queues close
        if let Ok(mut streams) = self.streams.lock() {
            for (_, entry) in std::mem::take(&mut streams.entries) {
                entry.flow.send.close();
                let _ = entry.tx.send(StreamEvent::End(end_reason::DESTROY));
            }
        }
        self.flow.send.close();
        if let Ok(mut incoming) = self.incoming.lock() {
            incoming.take();
        }
        if let Ok(mut hops) = self.hops.lock() {
            hops.clear();
        }
        if let Ok(mut reactor) = self.reactor.lock() {
            if let Some(task) = reactor.take() {
                task.abort();
            }
        }
        log::debug!("Circuit {} (id {}) destroyed", self.serial, self.id);
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            self.destroy(destroy_reason::FINISHED);
        }
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("serial", &self.serial)
            .field("id", &self.id)
            .field("state", &self.state())
            .field("hops", &self.route_established())
            .field("streams", &self.stream_count())
            .finish()
    }
}
