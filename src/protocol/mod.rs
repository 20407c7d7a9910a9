//! Onion-routing protocol implementation
//!
//! This module implements the wire-level protocol, including:
//! - Cell protocol and typed relay messages
//! - Counter-mode ciphers, running digests and KDF-TOR
//! - Hybrid RSA/AES encryption
//! - DH and CREATE_FAST handshakes
//! - Per-hop state and onion layering
//! - SENDME flow control
//! - Router metadata and path selection

mod cell;
mod crypto;
mod flow_control;
mod handshake;
mod hop;
mod hybrid;
mod msg;
mod onion;
mod relay;

pub use cell::{read_cell, write_cell, Cell, CellCommand, CircuitId, RelayCell, RelayCommand, StreamId};
pub use crypto::{ct_eq, kdf_tor, sha1, CtrCipher, HopKeys, RunningDigest, HASH_LEN, KEY_LEN};
pub use flow_control::{CircuitFlowControl, RecvWindow, SendWindow, StreamFlowControl};
pub use handshake::{
    answer_onion_skin, create_onion_skin, dh_respond, fast_respond, ClientHandshake, DhKeyPair,
    FastHandshake, DH_LEN, DH_REPLY_LEN, FAST_KEY_LEN, FAST_REPLY_LEN, ONION_SKIN_LEN,
};
pub use hop::Hop;
pub use hybrid::{asym_decrypt, asym_encrypt, first_chunk_len};
#[cfg(test)]
pub(crate) use hybrid::test_keys::rsa_1024 as hybrid_test_key;
pub use msg::{end_reason, establish_intro_signed_part, RelayMsg, ResolvedAnswer, COOKIE_LEN, IDENTITY_LEN};
pub use onion::{layer, peel};
pub use relay::{ExitPolicy, Fingerprint, RelaySelector, RouteTarget, Router, RouterFlags};
