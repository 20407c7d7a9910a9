//! Error types for the onion-routing engine
//!
//! This module provides the error taxonomy used across the crate:
//! - Detailed error variants for different failure modes
//! - Error classification (retryable, fatal to the circuit, fatal to the connection)
//! - User-friendly messages
//! - Error codes for programmatic handling

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    ConnectionClosed = 101,

    // Protocol errors (2xx)
    MalformedCell = 200,
    ProtocolViolation = 201,
    RelayCellNotRecognized = 202,

    // Circuit errors (3xx)
    CircuitBuildFailed = 300,
    CircuitDestroyed = 301,
    NoUsableCircuit = 302,
    HandshakeTimeout = 303,

    // Stream errors (4xx)
    StreamFailed = 400,
    StreamTimeout = 401,
    StreamClosed = 402,

    // Cryptographic errors (5xx)
    CryptoError = 500,

    // Hidden service errors (6xx)
    RendezvousFailed = 600,

    // Directory errors (7xx)
    DirectoryError = 700,

    // Configuration errors (8xx)
    ConfigError = 800,

    // Internal errors (9xx)
    InternalError = 900,
}

/// Phase of the hidden-service rendezvous protocol that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendezvousPhase {
    /// Building the rendezvous circuit and registering the cookie
    RendezvousPointSetup,
    /// Contacting the service through one of its introduction points
    Introduction,
    /// Waiting for RENDEZVOUS2 and finishing the DH exchange
    RendezvousCompletion,
    /// Opening the stream over the joined circuit
    StreamOpen,
}

impl fmt::Display for RendezvousPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RendezvousPhase::RendezvousPointSetup => "rendezvous point setup",
            RendezvousPhase::Introduction => "introduction",
            RendezvousPhase::RendezvousCompletion => "rendezvous completion",
            RendezvousPhase::StreamOpen => "stream open",
        };
        f.write_str(name)
    }
}

/// Main error type for the engine
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Connection Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    // ===== Protocol Errors =====
    #[error("Malformed cell: {0}")]
    MalformedCell(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Relay cell not recognized by any of {hops} hop(s)")]
    RelayCellNotRecognized { hops: usize },

    // ===== Circuit Errors =====
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("Circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("Handshake timed out: {0}")]
    HandshakeTimeout(String),

    #[error("No usable circuit: {0}")]
    NoUsableCircuit(String),

    // ===== Stream Errors =====
    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Stream timed out: {0}")]
    StreamTimeout(String),

    #[error("Stream closed: reason={0}")]
    StreamClosed(u8),

    // ===== Cryptographic Errors =====
    #[error("Crypto error: {0}")]
    CryptoError(String),

    // ===== Hidden Service Errors =====
    #[error("Connection to {destination} failed during {phase}: {cause}")]
    RendezvousFailed {
        phase: RendezvousPhase,
        destination: String,
        cause: String,
    },

    // ===== Directory Errors =====
    #[error("Directory error: {0}")]
    Directory(String),

    // ===== Network Errors =====
    #[error("Network error: {0}")]
    Network(String),

    // ===== Configuration Errors =====
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorError {
    /// Get the error code for programmatic handling
    pub fn code(&self) -> ErrorCode {
        match self {
            TorError::ConnectionFailed(_) | TorError::Network(_) => ErrorCode::ConnectionFailed,
            TorError::ConnectionClosed(_) => ErrorCode::ConnectionClosed,

            TorError::MalformedCell(_) => ErrorCode::MalformedCell,
            TorError::ProtocolError(_) => ErrorCode::ProtocolViolation,
            TorError::RelayCellNotRecognized { .. } => ErrorCode::RelayCellNotRecognized,

            TorError::CircuitBuildFailed(_) => ErrorCode::CircuitBuildFailed,
            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::HandshakeTimeout(_) => ErrorCode::HandshakeTimeout,
            TorError::NoUsableCircuit(_) => ErrorCode::NoUsableCircuit,

            TorError::Stream(_) => ErrorCode::StreamFailed,
            TorError::StreamTimeout(_) => ErrorCode::StreamTimeout,
            TorError::StreamClosed(_) => ErrorCode::StreamClosed,

            TorError::CryptoError(_) => ErrorCode::CryptoError,
            TorError::RendezvousFailed { .. } => ErrorCode::RendezvousFailed,
            TorError::Directory(_) => ErrorCode::DirectoryError,
            TorError::InvalidConfig(_) => ErrorCode::ConfigError,
            TorError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether this error can be retried, possibly over a different circuit
    ///
    /// Timeouts and "no circuit available" are retried locally up to the
    /// configured bounds before they surface to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailed(_)
                | TorError::ConnectionClosed(_)
                | TorError::Network(_)
                | TorError::CircuitBuildFailed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::HandshakeTimeout(_)
                | TorError::NoUsableCircuit(_)
                | TorError::StreamTimeout(_)
                | TorError::Stream(_)
                | TorError::CryptoError(_)
                | TorError::RelayCellNotRecognized { .. }
        )
    }

    /// Whether the circuit that produced this error must be torn down
    pub fn is_fatal_to_circuit(&self) -> bool {
        matches!(
            self,
            TorError::RelayCellNotRecognized { .. }
                | TorError::ProtocolError(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::MalformedCell(_)
                | TorError::ConnectionClosed(_)
        )
    }

    /// Whether the transport connection that produced this error must be closed
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            TorError::MalformedCell(_) | TorError::ConnectionClosed(_)
        )
    }

    /// Get a user-friendly message for display
    pub fn user_message(&self) -> String {
        match self {
            TorError::ConnectionFailed(_) | TorError::Network(_) => {
                "Failed to reach the relay network. Please check your connection.".into()
            }
            TorError::ConnectionClosed(_) => "The connection to a relay was closed.".into(),
            TorError::MalformedCell(_) | TorError::ProtocolError(_) => {
                "A relay sent data that violates the protocol.".into()
            }
            TorError::RelayCellNotRecognized { .. } => {
                "Data integrity check failed; the circuit was closed.".into()
            }
            TorError::CircuitBuildFailed(_) | TorError::HandshakeTimeout(_) => {
                "Failed to build a circuit. Please try again.".into()
            }
            TorError::CircuitDestroyed { reason, .. } => format!(
                "Your circuit was closed by a relay (reason {}). Please try again.",
                reason
            ),
            TorError::NoUsableCircuit(_) => {
                "No circuit is available right now. Please try again later.".into()
            }
            TorError::Stream(_) | TorError::StreamClosed(_) => {
                "Data transfer failed. Please try again.".into()
            }
            TorError::StreamTimeout(_) => "The destination did not answer in time.".into(),
            TorError::CryptoError(_) => "A cryptographic error occurred. Please try again.".into(),
            TorError::RendezvousFailed { phase, .. } => {
                format!("Could not reach the hidden service ({} failed).", phase)
            }
            TorError::Directory(_) => "The network directory is not available.".into(),
            TorError::InvalidConfig(_) => "Invalid settings. Please check your configuration.".into(),
            TorError::Internal(_) => "An internal error occurred. Please report this bug.".into(),
        }
    }

    /// Create a CircuitDestroyed error with the reason name
    pub fn circuit_destroyed(reason: u8) -> Self {
        TorError::CircuitDestroyed {
            reason,
            reason_name: destroy_reason_name(reason).to_string(),
        }
    }

    /// Wrap this error as a rendezvous failure of the given phase
    pub fn in_rendezvous_phase(self, phase: RendezvousPhase, destination: &str) -> Self {
        match self {
            already @ TorError::RendezvousFailed { .. } => already,
            other => TorError::RendezvousFailed {
                phase,
                destination: destination.to_string(),
                cause: other.to_string(),
            },
        }
    }
}

/// Name of a DESTROY / TRUNCATED reason code
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "OR_CONN_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}

impl From<rsa::Error> for TorError {
    fn from(err: rsa::Error) -> Self {
        TorError::CryptoError(err.to_string())
    }
}

/// Error information for status reporting
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
    pub user_message: String,
    pub is_retryable: bool,
}

impl From<&TorError> for ErrorInfo {
    fn from(err: &TorError) -> Self {
        ErrorInfo {
            code: err.code() as u32,
            message: err.to_string(),
            user_message: err.user_message(),
            is_retryable: err.is_retryable(),
        }
    }
}
