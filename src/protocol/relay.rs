//! Router types and path selection
//!
//! Defines router metadata supplied by the directory and the algorithm
//! that picks guard, middle, and exit positions for a new route.

use crate::error::{Result, TorError};
use rand::seq::SliceRandom;
use rsa::RsaPublicKey;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Router identity digest
pub type Fingerprint = [u8; 20];

/// A router from the directory
#[derive(Debug, Clone)]
pub struct Router {
    /// Router nickname
    pub nickname: String,

    /// Identity digest
    pub fingerprint: Fingerprint,

    /// IPv4 address
    pub address: Ipv4Addr,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// Onion key used for the CREATE handshake
    pub onion_key: RsaPublicKey,

    /// Router flags
    pub flags: RouterFlags,

    /// Advertised bandwidth (bytes/sec)
    pub bandwidth: u64,

    /// Exit policy summary
    pub exit_policy: ExitPolicy,
}

impl Router {
    /// Get the SocketAddr for connecting to this router
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.or_port))
    }

    /// Hex fingerprint, as used in logs and pool keys
    pub fn hex_fingerprint(&self) -> String {
        hex::encode_upper(self.fingerprint)
    }

    /// Short display name for logs
    pub fn display_name(&self) -> String {
        let hex = self.hex_fingerprint();
        format!("{} (${})", self.nickname, &hex[..8])
    }

    /// Check if this router can be used as a guard
    pub fn is_guard(&self) -> bool {
        self.flags.guard && self.flags.stable && self.flags.fast
    }

    /// Check if this router can be used as an exit towards `port`
    pub fn is_exit_for(&self, port: u16) -> bool {
        self.flags.exit && !self.flags.bad_exit && self.exit_policy.allows(port)
    }

    /// DER (PKCS#1) encoding of the onion key
    pub fn onion_key_der(&self) -> Result<Vec<u8>> {
        crate::directory::public_key_der(&self.onion_key)
    }

    /// Routers in the same /16 are treated as one operator
    fn network_16(&self) -> [u8; 2] {
        let octets = self.address.octets();
        [octets[0], octets[1]]
    }
}

/// Router flags from the directory
#[derive(Debug, Clone, Default)]
pub struct RouterFlags {
    /// BadExit - should not be used as exit
    pub bad_exit: bool,

    /// Exit - allows exit traffic
    pub exit: bool,

    /// Fast - fast router
    pub fast: bool,

    /// Guard - suitable as entry guard
    pub guard: bool,

    /// Running - currently running
    pub running: bool,

    /// Stable - stable router
    pub stable: bool,

    /// Valid - valid router descriptor
    pub valid: bool,
}

impl RouterFlags {
    /// Parse flags from a space-separated flag line
    pub fn from_string(flags: &str) -> Self {
        let mut router_flags = RouterFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "BadExit" => router_flags.bad_exit = true,
                "Exit" => router_flags.exit = true,
                "Fast" => router_flags.fast = true,
                "Guard" => router_flags.guard = true,
                "Running" => router_flags.running = true,
                "Stable" => router_flags.stable = true,
                "Valid" => router_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }

        router_flags
    }
}

/// Exit policy summary: either an accept list or a reject list of port ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitPolicy {
    Accept(Vec<(u16, u16)>),
    Reject(Vec<(u16, u16)>),
}

impl Default for ExitPolicy {
    fn default() -> Self {
        ExitPolicy::Reject(vec![(1, u16::MAX)])
    }
}

impl ExitPolicy {
    /// Accept every port
    pub fn accept_all() -> Self {
        ExitPolicy::Reject(Vec::new())
    }

    /// Parse a summary like `accept 80,443,6660-6669` or `reject 1-65535`
    pub fn parse(summary: &str) -> Result<Self> {
        let (kind, ports) = summary
            .trim()
            .split_once(' ')
            .ok_or_else(|| TorError::Directory(format!("Bad policy summary: {}", summary)))?;

        let mut ranges = Vec::new();
        for item in ports.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let parse = |s: &str| {
                s.parse::<u16>()
                    .map_err(|_| TorError::Directory(format!("Bad port in policy: {}", s)))
            };
            let range = match item.split_once('-') {
                Some((lo, hi)) => (parse(lo)?, parse(hi)?),
                None => {
                    let port = parse(item)?;
                    (port, port)
                }
            };
            ranges.push(range);
        }

        match kind {
            "accept" => Ok(ExitPolicy::Accept(ranges)),
            "reject" => Ok(ExitPolicy::Reject(ranges)),
            other => Err(TorError::Directory(format!("Bad policy kind: {}", other))),
        }
    }

    /// Whether traffic to `port` may exit
    pub fn allows(&self, port: u16) -> bool {
        let contains = |ranges: &[(u16, u16)]| ranges.iter().any(|&(lo, hi)| lo <= port && port <= hi);
        match self {
            ExitPolicy::Accept(ranges) => contains(ranges),
            ExitPolicy::Reject(ranges) => !contains(ranges),
        }
    }
}

/// What the last hop of a route must satisfy
#[derive(Debug, Clone)]
pub enum RouteTarget {
    /// Exit towards the given port
    Exit(u16),
    /// Any router (internal circuits, e.g. to pick a rendezvous point)
    Internal,
    /// A fixed last hop (rendezvous or introduction point)
    Pinned(Router),
}

/// Path selection over the directory's router list
#[derive(Clone)]
pub struct RelaySelector {
    /// All usable routers
    routers: Vec<Router>,
}

impl RelaySelector {
    /// Create a new selector; non-running or invalid routers are dropped
    pub fn new(routers: Vec<Router>) -> Self {
        let routers = routers
            .into_iter()
            .filter(|r| r.flags.running && r.flags.valid)
            .collect();
        Self { routers }
    }

    /// Get total number of usable routers
    pub fn count(&self) -> usize {
        self.routers.len()
    }

    /// Choose a route of `length` routers for `target`
    ///
    /// No two hops share a fingerprint or a /16 network.
    pub fn select_path(&self, length: usize, target: &RouteTarget) -> Result<Vec<Router>> {
        if length < 1 {
            return Err(TorError::InvalidConfig("Route length must be positive".into()));
        }
        let mut rng = rand::thread_rng();
        let mut used_fps: HashSet<Fingerprint> = HashSet::new();
        let mut used_nets: HashSet<[u8; 2]> = HashSet::new();

        // Last hop first: it is the most constrained
        let last = match target {
            RouteTarget::Pinned(router) => router.clone(),
            RouteTarget::Exit(port) => self
                .pick(&mut rng, &used_fps, &used_nets, |r| r.is_exit_for(*port))
                .ok_or_else(|| {
                    TorError::NoUsableCircuit(format!("No exit allows port {}", port))
                })?,
            RouteTarget::Internal => self
                .pick(&mut rng, &used_fps, &used_nets, |r| r.flags.fast)
                .or_else(|| self.pick(&mut rng, &used_fps, &used_nets, |_| true))
                .ok_or_else(|| TorError::NoUsableCircuit("No routers available".into()))?,
        };
        used_fps.insert(last.fingerprint);
        used_nets.insert(last.network_16());

        if length == 1 {
            return Ok(vec![last]);
        }

        let guard = self
            .pick(&mut rng, &used_fps, &used_nets, Router::is_guard)
            .or_else(|| self.pick(&mut rng, &used_fps, &used_nets, |r| r.flags.fast))
            .ok_or_else(|| TorError::NoUsableCircuit("No guard available".into()))?;
        used_fps.insert(guard.fingerprint);
        used_nets.insert(guard.network_16());

        let mut path = vec![guard];
        for _ in 0..length - 2 {
            let middle = self
                .pick(&mut rng, &used_fps, &used_nets, |r| r.flags.fast)
                .or_else(|| self.pick(&mut rng, &used_fps, &used_nets, |_| true))
                .ok_or_else(|| {
                    TorError::NoUsableCircuit(format!(
                        "Not enough distinct routers for a {}-hop route",
                        length
                    ))
                })?;
            used_fps.insert(middle.fingerprint);
            used_nets.insert(middle.network_16());
            path.push(middle);
        }
        path.push(last);

        log::debug!(
            "🎲 Selected path: {}",
            path.iter()
                .map(|r| r.nickname.as_str())
                .collect::<Vec<_>>()
                .join(" → ")
        );
        Ok(path)
    }

    /// Pick one random router matching `filter`, avoiding used identities and networks
    pub fn pick<F>(
        &self,
        rng: &mut impl rand::Rng,
        used_fps: &HashSet<Fingerprint>,
        used_nets: &HashSet<[u8; 2]>,
        filter: F,
    ) -> Option<Router>
    where
        F: Fn(&Router) -> bool,
    {
        let candidates: Vec<&Router> = self
            .routers
            .iter()
            .filter(|r| {
                !used_fps.contains(&r.fingerprint) && !used_nets.contains(&r.network_16()) && filter(r)
            })
            .collect();
        candidates.choose(rng).map(|r| (*r).clone())
    }

    /// Pick a random router for a rendezvous point
    pub fn select_rendezvous_point(&self) -> Result<Router> {
        let mut rng = rand::thread_rng();
        self.pick(&mut rng, &HashSet::new(), &HashSet::new(), |r| {
            r.flags.fast && r.flags.stable
        })
        .or_else(|| self.pick(&mut rng, &HashSet::new(), &HashSet::new(), |_| true))
        .ok_or_else(|| TorError::NoUsableCircuit("No rendezvous point available".into()))
    }

    /// Pick up to `count` distinct routers for introduction points
    pub fn select_introduction_points(&self, count: usize) -> Vec<Router> {
        let mut rng = rand::thread_rng();
        let mut candidates: Vec<&Router> = self.routers.iter().filter(|r| r.flags.stable).collect();
        if candidates.len() < count {
            candidates = self.routers.iter().collect();
        }
        candidates.shuffle(&mut rng);
        candidates.into_iter().take(count).cloned().collect()
    }
}
