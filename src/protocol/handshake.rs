//! Circuit handshakes
//!
//! Two ways to agree on hop keys:
//!
//! - The DH handshake (CREATE / EXTEND): the client sends `g^x`, hybrid
//!   encrypted to the relay's onion key, and gets back `g^y | KH`.
//!   The same exchange without the RSA wrapping joins a client and a
//!   hidden service at the rendezvous point.
//! - CREATE_FAST: the client sends 20 random bytes `X`, the relay answers
//!   with `Y | KH`, and `K0 = X | Y`. Only safe for the first hop, where
//!   the transport already authenticates the relay.

use crate::error::{Result, TorError};
use crate::protocol::crypto::{ct_eq, HopKeys, HASH_LEN};
use crate::protocol::hybrid::{asym_decrypt, asym_encrypt};
use rand::{CryptoRng, RngCore};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use std::sync::OnceLock;
use zeroize::Zeroize;

/// Length of a serialized DH public value
pub const DH_LEN: usize = 128;

/// Private exponent size in bytes (320 bits)
pub const DH_PRIVATE_LEN: usize = 40;

/// Length of the encrypted CREATE onion skin
pub const ONION_SKIN_LEN: usize = 186;

/// Length of a CREATED / EXTENDED / RENDEZVOUS2 reply
pub const DH_REPLY_LEN: usize = DH_LEN + HASH_LEN;

/// Length of the CREATE_FAST key material
pub const FAST_KEY_LEN: usize = HASH_LEN;

/// Length of a CREATED_FAST reply
pub const FAST_REPLY_LEN: usize = 2 * HASH_LEN;

/// 1024-bit MODP group prime (RFC 2409, section 6.2)
const DH_PRIME: [u8; DH_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2,
    0x21, 0x68, 0xc2, 0x34, 0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1,
    0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74, 0x02, 0x0b, 0xbe, 0xa6,
    0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d,
    0xf2, 0x5f, 0x14, 0x37, 0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45,
    0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6, 0xf4, 0x4c, 0x42, 0xe9,
    0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11,
    0x7c, 0x4b, 0x1f, 0xe6, 0x49, 0x28, 0x66, 0x51, 0xec, 0xe6, 0x53, 0x81,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

struct DhGroup {
    prime: BigUint,
    prime_minus_one: BigUint,
    generator: BigUint,
    one: BigUint,
}

fn group() -> &'static DhGroup {
    static GROUP: OnceLock<DhGroup> = OnceLock::new();
    GROUP.get_or_init(|| {
        let prime = BigUint::from_bytes_be(&DH_PRIME);
        let one = BigUint::from(1u32);
        DhGroup {
            prime_minus_one: &prime - &one,
            prime,
            generator: BigUint::from(2u32),
            one,
        }
    })
}

fn to_fixed(value: &BigUint) -> [u8; DH_LEN] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_LEN];
    let start = DH_LEN.saturating_sub(bytes.len());
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(DH_LEN)..]);
    out
}

/// Parse and range-check a peer's DH public value
fn parse_public(bytes: &[u8]) -> Result<BigUint> {
    if bytes.len() != DH_LEN {
        return Err(TorError::CryptoError(format!(
            "DH public value has {} bytes, expected {}",
            bytes.len(),
            DH_LEN
        )));
    }
    let g = group();
    let value = BigUint::from_bytes_be(bytes);
    if value <= g.one || value >= g.prime_minus_one {
        return Err(TorError::CryptoError("DH public value out of range".into()));
    }
    Ok(value)
}

/// Ephemeral Diffie-Hellman key pair
///
/// The exponent is kept as bytes and wiped on drop; its big-integer form
/// only lives for the length of one exponentiation.
pub struct DhKeyPair {
    private: [u8; DH_PRIVATE_LEN],
    public: [u8; DH_LEN],
}

impl DhKeyPair {
    /// Generate a fresh key pair with a 320-bit exponent
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let g = group();
        let mut private = [0u8; DH_PRIVATE_LEN];
        rng.fill_bytes(&mut private);
        let public = to_fixed(&Self::modpow_private(&private, &g.generator));
        Self { private, public }
    }

    /// `base^x mod p`
    fn modpow_private(private: &[u8; DH_PRIVATE_LEN], base: &BigUint) -> BigUint {
        let mut exponent = BigUint::from_bytes_be(private);
        let result = base.modpow(&exponent, &group().prime);
        exponent.zeroize();
        result
    }

    fn wipe(&mut self) {
        self.private.zeroize();
    }

    /// Our public value `g^x`
    pub fn public_bytes(&self) -> &[u8; DH_LEN] {
        &self.public
    }

    /// Compute `g^xy` from the peer's public value
    pub fn shared_secret(&self, peer_public: &[u8]) -> Result<Vec<u8>> {
        let peer = parse_public(peer_public)?;
        let mut shared = Self::modpow_private(&self.private, &peer);
        let bytes = to_fixed(&shared).to_vec();
        shared.zeroize();
        Ok(bytes)
    }

    /// Finish the handshake from a `g^y | KH` reply
    pub fn complete(&self, reply: &[u8]) -> Result<HopKeys> {
        if reply.len() < DH_REPLY_LEN {
            return Err(TorError::ProtocolError(format!(
                "Handshake reply of {} bytes, expected {}",
                reply.len(),
                DH_REPLY_LEN
            )));
        }
        let mut k0 = self.shared_secret(&reply[..DH_LEN])?;
        let keys = HopKeys::derive(&k0);
        k0.zeroize();

        if !ct_eq(&keys.kh, &reply[DH_LEN..DH_REPLY_LEN]) {
            return Err(TorError::CryptoError("Handshake KH mismatch".into()));
        }
        Ok(keys)
    }
}

impl Drop for DhKeyPair {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Answer a DH handshake given the peer's `g^x`
///
/// Returns the `g^y | KH` reply and the keys from the initiator's point of
/// view (use [`HopKeys::reversed`] on the answering side).
pub fn dh_respond<R: RngCore + CryptoRng>(
    rng: &mut R,
    peer_public: &[u8],
) -> Result<(Vec<u8>, HopKeys)> {
    let ours = DhKeyPair::generate(rng);
    let mut k0 = ours.shared_secret(peer_public)?;
    let keys = HopKeys::derive(&k0);
    k0.zeroize();

    let mut reply = Vec::with_capacity(DH_REPLY_LEN);
    reply.extend_from_slice(ours.public_bytes());
    reply.extend_from_slice(&keys.kh);
    Ok((reply, keys))
}

/// Build the 186-byte onion skin for a CREATE or EXTEND
pub fn create_onion_skin<R: RngCore + CryptoRng>(
    rng: &mut R,
    onion_key: &RsaPublicKey,
    dh: &DhKeyPair,
) -> Result<Vec<u8>> {
    let mut sym_key = [0u8; 16];
    rng.fill_bytes(&mut sym_key);
    let skin = asym_encrypt(rng, onion_key, &sym_key, dh.public_bytes());
    sym_key.zeroize();
    skin
}

/// Relay side of the DH handshake: open the onion skin and answer it
pub fn answer_onion_skin<R: RngCore + CryptoRng>(
    rng: &mut R,
    onion_key: &RsaPrivateKey,
    skin: &[u8],
) -> Result<(Vec<u8>, HopKeys)> {
    let gx = asym_decrypt(onion_key, skin)?;
    dh_respond(rng, &gx)
}

/// Client state of a CREATE_FAST handshake
pub struct FastHandshake {
    x: [u8; FAST_KEY_LEN],
}

impl FastHandshake {
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut x = [0u8; FAST_KEY_LEN];
        rng.fill_bytes(&mut x);
        Self { x }
    }

    /// The `X` sent in the CREATE_FAST payload
    pub fn key_material(&self) -> &[u8; FAST_KEY_LEN] {
        &self.x
    }

    /// Finish from a `Y | KH` reply
    pub fn complete(&self, reply: &[u8]) -> Result<HopKeys> {
        if reply.len() < FAST_REPLY_LEN {
            return Err(TorError::ProtocolError("CREATED_FAST reply too short".into()));
        }
        let keys = fast_keys(&self.x, &reply[..FAST_KEY_LEN]);
        if !ct_eq(&keys.kh, &reply[FAST_KEY_LEN..FAST_REPLY_LEN]) {
            return Err(TorError::CryptoError("CREATE_FAST KH mismatch".into()));
        }
        Ok(keys)
    }
}

impl Drop for FastHandshake {
    fn drop(&mut self) {
        self.x.zeroize();
    }
}

fn fast_keys(x: &[u8], y: &[u8]) -> HopKeys {
    let mut k0 = Vec::with_capacity(2 * FAST_KEY_LEN);
    k0.extend_from_slice(x);
    k0.extend_from_slice(y);
    let keys = HopKeys::derive(&k0);
    k0.zeroize();
    keys
}

/// Relay side of CREATE_FAST
pub fn fast_respond<R: RngCore + CryptoRng>(rng: &mut R, x: &[u8]) -> Result<(Vec<u8>, HopKeys)> {
    if x.len() < FAST_KEY_LEN {
        return Err(TorError::ProtocolError("CREATE_FAST payload too short".into()));
    }
    let mut y = [0u8; FAST_KEY_LEN];
    rng.fill_bytes(&mut y);
    let keys = fast_keys(&x[..FAST_KEY_LEN], &y);

    let mut reply = Vec::with_capacity(FAST_REPLY_LEN);
    reply.extend_from_slice(&y);
    reply.extend_from_slice(&keys.kh);
    Ok((reply, keys))
}

/// A client handshake in flight for one hop
pub enum ClientHandshake {
    Dh(DhKeyPair),
    Fast(FastHandshake),
}

impl ClientHandshake {
    /// Finish the handshake with the relay's reply
    pub fn complete(&self, reply: &[u8]) -> Result<HopKeys> {
        match self {
            ClientHandshake::Dh(dh) => dh.complete(reply),
            ClientHandshake::Fast(fast) => fast.complete(reply),
        }
    }
}
