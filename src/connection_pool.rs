//! Relay connections and connection pooling
//!
//! One [`Connection`] wraps one transport stream to a router. A writer
//! task drains an ordered queue of outgoing cells and a reader task
//! dispatches incoming cells to circuits by circuit id. Circuits sharing
//! a first hop share the connection.
//!
//! Security considerations:
//! - Circuit ids are random, so they do not reveal how many circuits exist
//! - A malformed cell closes the whole connection

use crate::error::{Result, TorError};
use crate::protocol::{read_cell, write_cell, Cell, CellCommand, CircuitId, Fingerprint, Router};
use crate::transport::Transport;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Attempts at drawing an unused random circuit id
const CIRCUIT_ID_ATTEMPTS: usize = 64;

/// State shared between a connection handle and its reader task
struct Shared {
    circuits: Mutex<HashMap<CircuitId, mpsc::UnboundedSender<Cell>>>,
    closed: AtomicBool,
}

impl Shared {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Dropping the senders tells every circuit reactor the link is gone
            if let Ok(mut circuits) = self.circuits.lock() {
                circuits.clear();
            }
        }
    }
}

/// An open link to one router
pub struct Connection {
    router: Router,
    outbound: mpsc::UnboundedSender<Cell>,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to `router` and start the reader and writer tasks
    pub async fn open(router: &Router, transport: &dyn Transport) -> Result<Arc<Self>> {
        log::debug!("🔌 Connecting to {} at {}", router.display_name(), router.socket_addr());
        let stream = transport.connect(router).await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let shared = Arc::new(Shared {
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let (outbound, mut queue) = mpsc::unbounded_channel::<Cell>();

        let writer_shared = shared.clone();
        let name = router.nickname.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(cell) = queue.recv().await {
                if let Err(e) = write_cell(&mut writer, &cell).await {
                    log::warn!("⚠️ Write to {} failed: {}", name, e);
                    break;
                }
            }
            writer_shared.close();
        });

        let reader_shared = shared.clone();
        let name = router.nickname.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_cell(&mut reader).await {
                    Ok(cell) => Self::dispatch(&reader_shared, cell),
                    Err(e) => {
                        match e {
                            TorError::ConnectionClosed(_) => {
                                log::debug!("Connection to {} closed", name)
                            }
                            other => log::warn!("⚠️ Closing connection to {}: {}", name, other),
                        }
                        break;
                    }
                }
            }
            reader_shared.close();
        });

        log::info!("✅ Connected to {}", router.display_name());
        Ok(Arc::new(Self {
            router: router.clone(),
            outbound,
            shared,
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }))
    }

    fn dispatch(shared: &Shared, cell: Cell) {
        if cell.circuit_id == 0 {
            if cell.command != CellCommand::Padding {
                log::debug!("Ignoring {:?} on circuit id 0", cell.command);
            }
            return;
        }
        let Ok(mut circuits) = shared.circuits.lock() else {
            return;
        };
        let id = cell.circuit_id;
        let delivered = match circuits.get(&id) {
            Some(tx) => tx.send(cell).is_ok(),
            None => {
                log::debug!("Dropping {:?} for unknown circuit {}", cell.command, id);
                return;
            }
        };
        if !delivered {
            circuits.remove(&id);
        }
    }

    /// Router at the other end
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Queue a cell for sending; cells go out in the order they are queued
    pub fn send(&self, cell: Cell) -> Result<()> {
        if self.is_closed() {
            return Err(TorError::ConnectionClosed(format!(
                "Link to {} is closed",
                self.router.nickname
            )));
        }
        self.outbound
            .send(cell)
            .map_err(|_| TorError::ConnectionClosed("Writer task stopped".into()))
    }

    /// Reserve a random unused circuit id and its inbound cell queue
    pub fn allocate_circuit(&self) -> Result<(CircuitId, mpsc::UnboundedReceiver<Cell>)> {
        if self.is_closed() {
            return Err(TorError::ConnectionClosed("Cannot add circuit to closed link".into()));
        }
        let mut circuits = self
            .shared
            .circuits
            .lock()
            .map_err(|_| TorError::Internal("Circuit table lock poisoned".into()))?;
        let mut rng = rand::thread_rng();
        for _ in 0..CIRCUIT_ID_ATTEMPTS {
            let id: CircuitId = rng.gen_range(1..=u16::MAX);
            if !circuits.contains_key(&id) {
                let (tx, rx) = mpsc::unbounded_channel();
                circuits.insert(id, tx);
                return Ok((id, rx));
            }
        }
        Err(TorError::Internal("No free circuit id on connection".into()))
    }

    /// Forget a circuit; later cells for its id are dropped
    pub fn remove_circuit(&self, id: CircuitId) {
        if let Ok(mut circuits) = self.shared.circuits.lock() {
            circuits.remove(&id);
        }
    }

    /// Circuits currently registered on this link
    pub fn circuit_count(&self) -> usize {
        self.shared.circuits.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Close the link and stop both tasks
    pub fn close(&self) {
        self.shared.close();
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Statistics about connection pooling
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionPoolStats {
    /// Total connections created
    pub connections_created: u64,
    /// Connections served from pool (reused)
    pub pool_hits: u64,
    /// Closed connections removed from the pool
    pub connections_pruned: u64,
    /// Current number of pooled connections
    pub current_pool_size: usize,
}

/// Pool of relay connections, one per router fingerprint
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<Fingerprint, Arc<Connection>>>,
    created: AtomicU64,
    hits: AtomicU64,
    pruned: AtomicU64,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<Connection>> {
        let connections = self.connections.lock().ok()?;
        connections
            .get(fingerprint)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Get an open connection to `router`, connecting if needed
    pub async fn get_or_connect(&self, router: &Router) -> Result<Arc<Connection>> {
        if let Some(conn) = self.lookup(&router.fingerprint) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("♻️ Reusing connection to {}", router.nickname);
            return Ok(conn);
        }

        let fresh = Connection::open(router, self.transport.as_ref()).await?;
        self.created.fetch_add(1, Ordering::Relaxed);

        let mut connections = self
            .connections
            .lock()
            .map_err(|_| TorError::Internal("Connection pool lock poisoned".into()))?;
        // Another build may have connected while we were waiting
        if let Some(existing) = connections.get(&router.fingerprint) {
            if !existing.is_closed() {
                fresh.close();
                return Ok(existing.clone());
            }
        }
        connections.insert(router.fingerprint, fresh.clone());
        Ok(fresh)
    }

    /// Drop closed connections and open ones nobody uses; returns how many went
    pub fn prune(&self) -> usize {
        let Ok(mut connections) = self.connections.lock() else {
            return 0;
        };
        let before = connections.len();
        connections.retain(|_, conn| {
            let keep = !conn.is_closed() && (conn.circuit_count() > 0 || Arc::strong_count(conn) > 1);
            if !keep {
                conn.close();
            }
            keep
        });
        let removed = before - connections.len();
        self.pruned.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Close every pooled connection
    pub fn close_all(&self) {
        if let Ok(mut connections) = self.connections.lock() {
            for (_, conn) in connections.drain() {
                conn.close();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionPoolStats {
        ConnectionPoolStats {
            connections_created: self.created.load(Ordering::Relaxed),
            pool_hits: self.hits.load(Ordering::Relaxed),
            connections_pruned: self.pruned.load(Ordering::Relaxed),
            current_pool_size: self.len(),
        }
    }
}
