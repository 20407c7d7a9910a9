//! Background circuit management
//!
//! Keeps a small pool of clean, established circuits ready for new
//! streams and hands out circuits for connect requests.
//!
//! Each maintenance pass:
//! - forgets destroyed circuits
//! - closes used circuits that have been idle too long and clean ones past their age limit
//! - sends a RELAY_DROP on circuits that have been silent for a while
//! - starts new builds, each as its own task, when fewer than the minimum
//!   of clean circuits exist
//!
//! Security considerations:
//! - Limited pool size (prevents fingerprinting)
//! - Circuits are retired after the idle timeout (stale circuits are suspicious)
//! - No destination-specific prebuilding (reveals intent)

use crate::circuit::{destroy_reason, Circuit, CircuitBuilder, Stream, StreamTarget};
use crate::config::Settings;
use crate::connection_pool::ConnectionPool;
use crate::directory::Directory;
use crate::error::{Result, TorError};
use crate::protocol::{RelaySelector, RouteTarget};
use crate::transport::Transport;
use futures::future::{select_ok, BoxFuture, FutureExt};
use rand::Rng;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Circuit counts for the application surface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitStatus {
    /// Alive plus closed
    pub total: usize,
    /// Tracked circuits not yet destroyed
    pub alive: usize,
    pub established: usize,
    /// Builds in progress
    pub building: usize,
    /// Circuits destroyed since start
    pub closed: usize,
    /// Open streams over all circuits
    pub streams: usize,
    /// Open relay connections
    pub connections: usize,
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub collected: usize,
    pub retired: usize,
    pub keepalives: usize,
    pub streams_expired: usize,
    pub builds_started: usize,
    pub connections_pruned: usize,
}

/// Counts a build in progress for as long as it lives
struct PendingBuild<'a>(&'a AtomicUsize);

impl<'a> PendingBuild<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingBuild<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns every circuit of a client
pub struct CircuitManager {
    settings: Arc<Settings>,
    directory: Arc<dyn Directory>,
    connections: Arc<ConnectionPool>,
    builder: CircuitBuilder,
    circuits: Mutex<Vec<Arc<Circuit>>>,
    pending: AtomicUsize,
    closed_total: AtomicUsize,
    build_failures: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl CircuitManager {
    pub fn new(
        settings: Arc<Settings>,
        directory: Arc<dyn Directory>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let connections = Arc::new(ConnectionPool::new(transport));
        Arc::new(Self {
            builder: CircuitBuilder::new(settings.clone(), connections.clone()),
            settings,
            directory,
            connections,
            circuits: Mutex::new(Vec::new()),
            pending: AtomicUsize::new(0),
            closed_total: AtomicUsize::new(0),
            build_failures: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn connections(&self) -> &Arc<ConnectionPool> {
        &self.connections
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Builds that failed since start
    pub fn build_failures(&self) -> u64 {
        self.build_failures.load(Ordering::Relaxed)
    }

    /// Run [`maintain`](Self::maintain) every maintenance interval
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.settings.maintenance_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if manager.is_closed() {
                    return;
                }
                let report = manager.maintain();
                log::trace!("Maintenance: {:?}", report);
            }
        });
        self.track_task(task);
        log::info!("♻️ Circuit manager started (every {:?})", period);
    }

    fn track_task(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    fn snapshot(&self) -> Vec<Arc<Circuit>> {
        self.circuits.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Clean circuits waiting for their first stream
    fn idle_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| c.is_established() && !c.is_exclusive() && !c.is_dirty())
            .count()
    }

    /// One maintenance pass; failures are logged, never returned
    pub fn maintain(self: &Arc<Self>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_closed() {
            return report;
        }

        // Forget destroyed circuits
        if let Ok(mut circuits) = self.circuits.lock() {
            let before = circuits.len();
            circuits.retain(|c| !c.is_destroyed());
            report.collected = before - circuits.len();
        }
        self.closed_total.fetch_add(report.collected, Ordering::SeqCst);

        let idle_timeout = self.settings.circuit_idle_timeout();
        let keepalive_idle = self.settings.keepalive_idle();
        for circuit in self.snapshot() {
            report.streams_expired +=
                circuit.expire_pending_streams(self.settings.stream_open_timeout());

            let unused = circuit.stream_count() == 0;
            let stale = if circuit.is_dirty() {
                unused && circuit.traffic_idle_for() > idle_timeout
            } else {
                !circuit.is_exclusive() && circuit.age() > idle_timeout
            };
            if stale {
                log::debug!(
                    "Retiring circuit {} (no traffic for {:?})",
                    circuit.serial(),
                    circuit.traffic_idle_for()
                );
                circuit.destroy(destroy_reason::FINISHED);
                report.retired += 1;
                continue;
            }

            if circuit.is_established() && circuit.idle_for() > keepalive_idle {
                match circuit.send_keepalive() {
                    Ok(()) => report.keepalives += 1,
                    Err(e) => log::warn!("⚠️ Keepalive on circuit {} failed: {}", circuit.serial(), e),
                }
            }
        }

        report.builds_started = self.replenish();
        report.connections_pruned = self.connections.prune();
        report
    }

    /// Start builds when the idle pool is below its minimum; returns how many
    fn replenish(self: &Arc<Self>) -> usize {
        let idle = self.idle_count();
        let pending = self.pending.load(Ordering::SeqCst);
        if idle + pending >= self.settings.min_idle_circuits {
            return 0;
        }
        if !self.directory.is_ready() {
            log::debug!("Directory not ready, not building circuits");
            return 0;
        }

        let alive = self.alive_count();
        let wanted = self.settings.max_idle_circuits() - (idle + pending);
        let room = self
            .settings
            .max_circuits
            .saturating_sub(alive + pending);
        let count = wanted.min(room);

        for _ in 0..count {
            let manager = self.clone();
            let task = tokio::spawn(async move {
                match manager.build_circuit(RouteTarget::Internal, false).await {
                    Ok(circuit) => log::debug!("Idle circuit {} ready", circuit.serial()),
                    Err(e) => log::warn!("⚠️ Idle circuit build failed: {}", e),
                }
            });
            self.track_task(task);
        }
        if count > 0 {
            log::info!("🔨 Building {} idle circuit(s) ({} idle, {} pending)", count, idle, pending);
        }
        count
    }

    fn alive_count(&self) -> usize {
        self.snapshot().iter().filter(|c| !c.is_destroyed()).count()
    }

    /// Routers the directory currently offers
    pub async fn selector(&self) -> Result<RelaySelector> {
        if !self.directory.is_ready() {
            return Err(TorError::NoUsableCircuit("Directory is not ready".into()));
        }
        Ok(RelaySelector::new(self.directory.valid_routers().await?))
    }

    fn route_length(&self) -> usize {
        let (min, max) = (self.settings.route_min_length, self.settings.route_max_length);
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    /// Build and track a circuit towards `target`
    pub async fn build_circuit(&self, target: RouteTarget, exclusive: bool) -> Result<Arc<Circuit>> {
        if self.is_closed() {
            return Err(TorError::NoUsableCircuit("Client is closed".into()));
        }
        let pending = PendingBuild::new(&self.pending);
        let in_use = self.alive_count() + self.pending.load(Ordering::SeqCst);
        // `in_use` counts this build too
        if in_use > self.settings.max_circuits {
            return Err(TorError::NoUsableCircuit(format!(
                "Circuit limit of {} reached",
                self.settings.max_circuits
            )));
        }

        let path = self.selector().await?.select_path(self.route_length(), &target)?;
        let circuit = match self.builder.build(&path).await {
            Ok(circuit) => circuit,
            Err(e) => {
                self.build_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        circuit.set_exclusive(exclusive);
        if let Ok(mut circuits) = self.circuits.lock() {
            circuits.push(circuit.clone());
        }
        drop(pending);
        Ok(circuit)
    }

    /// Established shared circuits able to carry a stream for `port`, least loaded first
    fn usable_circuits(&self, port: Option<u16>) -> Vec<Arc<Circuit>> {
        let mut usable: Vec<Arc<Circuit>> = self
            .snapshot()
            .into_iter()
            .filter(|c| !c.is_exclusive() && c.has_capacity())
            .filter(|c| port.map_or(true, |p| c.allows_exit_port(p)))
            .collect();
        usable.sort_by_key(|c| c.stream_count());
        usable
    }

    fn route_target(port: Option<u16>) -> RouteTarget {
        port.map_or(RouteTarget::Internal, RouteTarget::Exit)
    }

    /// A shared circuit for `port`, built on demand
    pub async fn get_circuit(&self, port: Option<u16>) -> Result<Arc<Circuit>> {
        if let Some(circuit) = self.usable_circuits(port).into_iter().next() {
            log::debug!("♻️ Reusing circuit {}", circuit.serial());
            return Ok(circuit);
        }
        self.build_circuit(Self::route_target(port), false).await
    }

    /// Open a stream, retrying retryable failures up to the configured count
    ///
    /// `port` is the exit port the last hop must allow (`None` for
    /// directory streams). Isolated requests get a fresh exclusive circuit
    /// that closes with its stream.
    pub async fn connect(
        self: &Arc<Self>,
        target: StreamTarget,
        port: Option<u16>,
        isolated: bool,
    ) -> Result<Stream> {
        let attempts = self.settings.connect_retries.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let result = if isolated {
                self.open_isolated(target.clone(), port).await
            } else if self.settings.very_aggressive_stream_building {
                self.open_racing(target.clone(), port).await
            } else {
                match self.get_circuit(port).await {
                    Ok(circuit) => circuit.open_stream(target.clone()).await,
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    log::warn!("⚠️ Connect to {} failed (attempt {}/{}): {}", target, attempt, attempts, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| TorError::NoUsableCircuit(format!("Cannot reach {}", target))))
    }

    /// Resolve `hostname` at an exit allowing `port`, with the same retry bound as [`connect`](Self::connect)
    ///
    /// Each retry moves to a circuit that has not answered yet.
    pub async fn resolve(&self, hostname: &str, port: u16) -> Result<Vec<IpAddr>> {
        let attempts = self.settings.connect_retries.max(1);
        let mut tried: Vec<u64> = Vec::new();
        let mut last_error = None;
        for attempt in 1..=attempts {
            let fresh = self
                .usable_circuits(Some(port))
                .into_iter()
                .find(|c| !tried.contains(&c.serial()));
            let circuit = match fresh {
                Some(circuit) => Ok(circuit),
                None => self.build_circuit(RouteTarget::Exit(port), false).await,
            };
            let result = match circuit {
                Ok(circuit) => {
                    tried.push(circuit.serial());
                    circuit.resolve(hostname).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(addrs) => return Ok(addrs),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    log::warn!("⚠️ Resolving {} failed (attempt {}/{}): {}", hostname, attempt, attempts, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| TorError::NoUsableCircuit(format!("Cannot resolve {}", hostname))))
    }

    async fn open_isolated(&self, target: StreamTarget, port: Option<u16>) -> Result<Stream> {
        let circuit = self.build_circuit(Self::route_target(port), true).await?;
        circuit.set_close_on_last_stream(true);
        match circuit.open_stream(target).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                circuit.destroy(destroy_reason::FINISHED);
                Err(e)
            }
        }
    }

    /// Race stream opens over several circuits; the first success wins
    ///
    /// The losing attempts are dropped, which closes their streams.
    async fn open_racing(self: &Arc<Self>, target: StreamTarget, port: Option<u16>) -> Result<Stream> {
        let parallelism = self.settings.aggressive_parallelism.max(1);
        let mut attempts: Vec<BoxFuture<'static, Result<Stream>>> = Vec::with_capacity(parallelism);
        for circuit in self.usable_circuits(port).into_iter().take(parallelism) {
            let target = target.clone();
            attempts.push(async move { circuit.open_stream(target).await }.boxed());
        }
        while attempts.len() < parallelism {
            let manager = self.clone();
            let target = target.clone();
            attempts.push(
                async move {
                    let circuit = manager.build_circuit(Self::route_target(port), false).await?;
                    circuit.open_stream(target).await
                }
                .boxed(),
            );
        }
        log::debug!("🏁 Racing {} stream opens to {}", attempts.len(), target);
        let (stream, _losers) = select_ok(attempts).await?;
        Ok(stream)
    }

    /// Circuit counts
    pub fn status(&self) -> CircuitStatus {
        let circuits = self.snapshot();
        let destroyed = circuits.iter().filter(|c| c.is_destroyed()).count();
        let alive = circuits.len() - destroyed;
        let closed = self.closed_total.load(Ordering::SeqCst) + destroyed;
        CircuitStatus {
            total: alive + closed,
            alive,
            established: circuits.iter().filter(|c| c.is_established()).count(),
            building: self.pending.load(Ordering::SeqCst),
            closed,
            streams: circuits.iter().map(|c| c.stream_count()).sum(),
            connections: self.connections.len(),
        }
    }

    /// Stop maintenance and destroy every circuit
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let circuits = self
            .circuits
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default();
        for circuit in &circuits {
            if !circuit.is_destroyed() {
                circuit.destroy(destroy_reason::REQUESTED);
            }
        }
        self.closed_total.fetch_add(circuits.len(), Ordering::SeqCst);
        self.connections.close_all();
        log::info!("🔌 Circuit manager closed ({} circuits)", circuits.len());
    }
}

impl Drop for CircuitManager {
    fn drop(&mut self) {
        self.close();
    }
}
