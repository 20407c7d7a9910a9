//! Per-hop session state
//!
//! A [`Hop`] owns both directions' ciphers and running digests for one
//! relay of a circuit. "Forward" always means away from the owner of the
//! hop list: for a client that is towards the relay, for the relay side
//! (built with [`Hop::new_reversed`]) it is back towards the client.

use crate::protocol::cell::{Cell, RelayCell};
use crate::protocol::crypto::{ct_eq, CtrCipher, HopKeys, RunningDigest};
use crate::protocol::relay::Router;

/// Session state for one hop
#[derive(Debug)]
pub struct Hop {
    /// The router behind this hop; `None` for a rendezvous virtual hop
    router: Option<Router>,
    forward_cipher: CtrCipher,
    backward_cipher: CtrCipher,
    forward_digest: RunningDigest,
    backward_digest: RunningDigest,
    /// KH of the handshake, needed to authenticate ESTABLISH_INTRO
    kh: [u8; 20],
}

impl Hop {
    /// Build hop state as the circuit originator sees it
    pub fn new(keys: &HopKeys, router: Option<Router>) -> Self {
        Self {
            router,
            forward_cipher: CtrCipher::new(&keys.forward_key),
            backward_cipher: CtrCipher::new(&keys.backward_key),
            forward_digest: RunningDigest::new(&keys.forward_digest),
            backward_digest: RunningDigest::new(&keys.backward_digest),
            kh: keys.kh,
        }
    }

    /// Build hop state as the answering side sees it
    pub fn new_reversed(keys: &HopKeys, router: Option<Router>) -> Self {
        Self::new(&keys.reversed(), router)
    }

    pub fn router(&self) -> Option<&Router> {
        self.router.as_ref()
    }

    pub fn is_virtual(&self) -> bool {
        self.router.is_none()
    }

    pub fn kh(&self) -> &[u8; 20] {
        &self.kh
    }

    /// Log-friendly name
    pub fn name(&self) -> String {
        match &self.router {
            Some(router) => router.nickname.clone(),
            None => "<virtual>".to_string(),
        }
    }

    /// Stamp the forward running digest into an outgoing relay payload
    pub fn seal(&mut self, payload: &mut [u8; Cell::PAYLOAD_SIZE]) {
        payload[RelayCell::DIGEST_RANGE].fill(0);
        let tag = self.forward_digest.update_and_tag(payload);
        payload[RelayCell::DIGEST_RANGE].copy_from_slice(&tag);
    }

    /// Add this hop's forward layer
    pub fn encrypt_forward(&mut self, payload: &mut [u8]) {
        self.forward_cipher.process(payload);
    }

    /// Remove this hop's backward layer
    pub fn decrypt_backward(&mut self, payload: &mut [u8]) {
        self.backward_cipher.process(payload);
    }

    /// Whether a decrypted payload originated at this hop
    ///
    /// The backward digest only advances when the cell matches.
    pub fn check(&mut self, payload: &[u8; Cell::PAYLOAD_SIZE]) -> bool {
        if payload[RelayCell::RECOGNIZED_RANGE] != [0, 0] {
            return false;
        }
        let mut zeroed = *payload;
        zeroed[RelayCell::DIGEST_RANGE].fill(0);
        let (candidate, tag) = self.backward_digest.peek_tag(&zeroed);
        if ct_eq(&tag, &payload[RelayCell::DIGEST_RANGE]) {
            self.backward_digest = candidate;
            true
        } else {
            false
        }
    }
}
