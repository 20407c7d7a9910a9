//! Circuit cryptography primitives
//!
//! Implements the symmetric building blocks each hop uses:
//! - AES-128-CTR keystream (one instance per hop per direction)
//! - SHA-1 running digests for relay cell integrity
//! - KDF-TOR key derivation from a handshake secret
//!
//! Security: All key material is zeroized on drop to prevent memory leakage.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use sha1::{Digest, Sha1};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// Symmetric key length (AES-128)
pub const KEY_LEN: usize = 16;

/// SHA-1 output length
pub const HASH_LEN: usize = 20;

/// Counter-mode keystream wrapper
///
/// Keeps its position across calls, so feeding a message in pieces gives
/// the same output as feeding it at once. Encryption and decryption are
/// the same operation.
pub struct CtrCipher {
    inner: Aes128Ctr,
}

impl CtrCipher {
    /// Create a cipher with a zero IV
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let iv = [0u8; 16];
        Self {
            inner: Aes128Ctr::new(key.into(), (&iv).into()),
        }
    }

    /// XOR `data` in place with the next bytes of keystream
    pub fn process(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }

    /// Process a copy of `data`
    pub fn process_to_vec(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        self.process(&mut out);
        out
    }
}

impl std::fmt::Debug for CtrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CtrCipher { .. }")
    }
}

/// Running SHA-1 digest over every relay cell of one hop and direction
///
/// The accumulator is never reset. Checking a candidate cell works on a
/// clone, and the state only advances when the candidate matches.
#[derive(Clone)]
pub struct RunningDigest {
    hasher: Sha1,
}

impl RunningDigest {
    /// Seed the accumulator with a derived digest seed (Df or Db)
    pub fn new(seed: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(seed);
        Self { hasher }
    }

    /// Absorb `data` and return the first four bytes of the current hash
    pub fn update_and_tag(&mut self, data: &[u8]) -> [u8; 4] {
        self.hasher.update(data);
        let full = self.hasher.clone().finalize();
        [full[0], full[1], full[2], full[3]]
    }

    /// Tag `data` would get, without advancing the accumulator
    pub fn peek_tag(&self, data: &[u8]) -> (Self, [u8; 4]) {
        let mut candidate = self.clone();
        let tag = candidate.update_and_tag(data);
        (candidate, tag)
    }
}

impl std::fmt::Debug for RunningDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RunningDigest { .. }")
    }
}

/// Key material for one hop, derived with KDF-TOR
///
/// ```text
/// K = SHA1(K0 | 0x00) | SHA1(K0 | 0x01) | ...
/// KH (20) | Df (20) | Db (20) | Kf (16) | Kb (16) = 92 bytes
/// ```
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    /// Handshake confirmation value
    pub kh: [u8; HASH_LEN],

    /// Forward digest seed (client → relay)
    pub forward_digest: [u8; HASH_LEN],

    /// Backward digest seed (relay → client)
    pub backward_digest: [u8; HASH_LEN],

    /// Forward encryption key (client → relay)
    pub forward_key: [u8; KEY_LEN],

    /// Backward encryption key (relay → client)
    pub backward_key: [u8; KEY_LEN],
}

impl HopKeys {
    /// Bytes of KDF output consumed
    pub const LEN: usize = 3 * HASH_LEN + 2 * KEY_LEN;

    /// Derive hop keys from the shared secret K0
    pub fn derive(k0: &[u8]) -> Self {
        let mut okm = kdf_tor(k0, Self::LEN);

        let mut keys = Self {
            kh: [0; HASH_LEN],
            forward_digest: [0; HASH_LEN],
            backward_digest: [0; HASH_LEN],
            forward_key: [0; KEY_LEN],
            backward_key: [0; KEY_LEN],
        };
        keys.kh.copy_from_slice(&okm[0..20]);
        keys.forward_digest.copy_from_slice(&okm[20..40]);
        keys.backward_digest.copy_from_slice(&okm[40..60]);
        keys.forward_key.copy_from_slice(&okm[60..76]);
        keys.backward_key.copy_from_slice(&okm[76..92]);
        okm.zeroize();

        log::trace!("🔑 Derived hop keys (KH prefix {:02x?})", &keys.kh[..4]);
        keys
    }

    /// Same material with the directions swapped (the relay's view)
    pub fn reversed(&self) -> Self {
        Self {
            kh: self.kh,
            forward_digest: self.backward_digest,
            backward_digest: self.forward_digest,
            forward_key: self.backward_key,
            backward_key: self.forward_key,
        }
    }
}

impl std::fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HopKeys { .. }")
    }
}

/// KDF-TOR: expand `k0` into `len` bytes by hashing it with a counter byte
pub fn kdf_tor(k0: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len + HASH_LEN);
    let mut counter = 0u8;
    while out.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(k0);
        hasher.update([counter]);
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }
    out.truncate(len);
    out
}

/// SHA-1 of a byte string
pub fn sha1(data: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&Sha1::digest(data));
    out
}

/// Constant-time equality for handshake confirmations
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && bool::from(a.ct_eq(b))
}
