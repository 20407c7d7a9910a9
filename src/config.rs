//! Engine settings
//!
//! All tunables are carried in one plain [`Settings`] value that the host
//! hands to the client, the circuit manager and the builders. Nothing in
//! the crate reads global configuration.

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shortest route the engine will build
pub const MIN_ROUTE_LENGTH: usize = 2;

/// Longest route the engine will build (RELAY_EARLY budget)
pub const MAX_ROUTE_LENGTH: usize = 8;

/// Settings for circuits, streams and the background manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Minimum number of hops per circuit
    pub route_min_length: usize,

    /// Maximum number of hops per circuit
    pub route_max_length: usize,

    /// Established idle circuits the manager keeps ready
    pub min_idle_circuits: usize,

    /// Hard ceiling on live circuits
    pub max_circuits: usize,

    /// Streams a circuit may carry before it stops accepting new ones
    pub streams_per_circuit: usize,

    /// Per-hop handshake timeout (ms)
    pub circuit_build_timeout_ms: u64,

    /// Wait for RELAY_CONNECTED (ms)
    pub stream_open_timeout_ms: u64,

    /// Wait for RELAY_RESOLVED (ms)
    pub resolve_timeout_ms: u64,

    /// Each bounded wait of the rendezvous protocol (ms)
    pub rendezvous_timeout_ms: u64,

    /// A used circuit without streams is closed after this long (ms)
    pub circuit_idle_timeout_ms: u64,

    /// Circuits silent for this long get a keepalive cell (ms)
    pub keepalive_idle_ms: u64,

    /// Interval between background maintenance passes (ms)
    pub maintenance_interval_ms: u64,

    /// Attempts for an exit connect before surfacing the error
    pub connect_retries: usize,

    /// Full rendezvous attempts for a hidden-service connect
    pub rendezvous_attempts: usize,

    /// Use CREATE_FAST instead of the DH handshake for the first hop
    pub use_create_fast: bool,

    /// Race stream opens over several circuits and keep the first success
    pub very_aggressive_stream_building: bool,

    /// Number of circuits raced when aggressive building is on
    pub aggressive_parallelism: usize,

    /// Initial circuit-level SENDME window (cells)
    pub circuit_window: u16,

    /// Circuit-level SENDME increment (cells)
    pub circuit_window_increment: u16,

    /// Initial stream-level SENDME window (cells)
    pub stream_window: u16,

    /// Stream-level SENDME increment (cells)
    pub stream_window_increment: u16,

    /// Introduction points a provided hidden service establishes
    pub hidden_service_intro_points: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            route_min_length: 3,
            route_max_length: 3,
            min_idle_circuits: 3,
            max_circuits: 30,
            streams_per_circuit: 50,
            circuit_build_timeout_ms: 20_000,
            stream_open_timeout_ms: 10_000,
            resolve_timeout_ms: 10_000,
            rendezvous_timeout_ms: 30_000,
            circuit_idle_timeout_ms: 10 * 60 * 1000, // 10 minutes
            keepalive_idle_ms: 60_000,
            maintenance_interval_ms: 3_000,
            connect_retries: 3,
            rendezvous_attempts: 2,
            use_create_fast: false,
            very_aggressive_stream_building: false,
            aggressive_parallelism: 3,
            circuit_window: 1000,
            circuit_window_increment: 100,
            stream_window: 500,
            stream_window_increment: 50,
            hidden_service_intro_points: 3,
        }
    }
}

impl Settings {
    /// Parse settings from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json)
            .map_err(|e| TorError::InvalidConfig(format!("Unparseable settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that all values are within the ranges the engine supports
    pub fn validate(&self) -> Result<()> {
        if self.route_min_length < MIN_ROUTE_LENGTH || self.route_max_length > MAX_ROUTE_LENGTH {
            return Err(TorError::InvalidConfig(format!(
                "Route length must stay within {}..={} (got {}..={})",
                MIN_ROUTE_LENGTH, MAX_ROUTE_LENGTH, self.route_min_length, self.route_max_length
            )));
        }
        if self.route_min_length > self.route_max_length {
            return Err(TorError::InvalidConfig(
                "route_min_length exceeds route_max_length".into(),
            ));
        }
        if self.max_circuits == 0 || self.streams_per_circuit == 0 {
            return Err(TorError::InvalidConfig(
                "max_circuits and streams_per_circuit must be positive".into(),
            ));
        }
        let timeouts = [
            self.circuit_build_timeout_ms,
            self.stream_open_timeout_ms,
            self.resolve_timeout_ms,
            self.rendezvous_timeout_ms,
            self.maintenance_interval_ms,
        ];
        if timeouts.iter().any(|&t| t == 0) {
            return Err(TorError::InvalidConfig("Timeouts must be non-zero".into()));
        }
        if self.circuit_window_increment == 0
            || self.stream_window_increment == 0
            || self.circuit_window < self.circuit_window_increment
            || self.stream_window < self.stream_window_increment
        {
            return Err(TorError::InvalidConfig(
                "Flow-control windows must be at least one increment".into(),
            ));
        }
        if self.connect_retries == 0 || self.rendezvous_attempts == 0 {
            return Err(TorError::InvalidConfig("Retry counts must be positive".into()));
        }
        Ok(())
    }

    /// Upper bound of the idle pool: the manager never spawns past this
    pub fn max_idle_circuits(&self) -> usize {
        self.min_idle_circuits + self.min_idle_circuits / 2
    }

    pub fn circuit_build_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_build_timeout_ms)
    }

    pub fn stream_open_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_open_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    pub fn circuit_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_idle_timeout_ms)
    }

    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_millis(self.keepalive_idle_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}
