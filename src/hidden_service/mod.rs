//! Hidden services
//!
//! The client side performs the rendezvous protocol to reach a `.onion`
//! service; the service side keeps introduction points open and answers
//! introductions by meeting the client at its rendezvous point.
//!
//! ```text
//! client ── ESTABLISH_RENDEZVOUS ──▶ RP
//! client ── INTRODUCE1 ──▶ IP ── INTRODUCE2 ──▶ service
//! service ── RENDEZVOUS1 ──▶ RP ── RENDEZVOUS2 ──▶ client
//! ```

mod client;
mod service;

pub use client::connect;
pub use service::{provide, HiddenService, HiddenServiceKeys, PortHandler};

use crate::directory::public_key_der;
use crate::error::{Result, TorError};
use crate::protocol::{sha1, ExitPolicy, Router, RouterFlags, COOKIE_LEN, DH_LEN, IDENTITY_LEN};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::RsaPublicKey;
use std::net::Ipv4Addr;

/// Version byte of the INTRODUCE plaintext
const INTRODUCE_VERSION: u8 = 2;

/// Suffix hashed with KH to authenticate ESTABLISH_INTRO
const INTRO_AUTH_SUFFIX: &[u8] = b"INTRODUCE";

/// `SHA1(KH | "INTRODUCE")`, binding ESTABLISH_INTRO to its circuit
pub(crate) fn intro_handshake_auth(kh: &[u8; 20]) -> [u8; 20] {
    let mut input = Vec::with_capacity(kh.len() + INTRO_AUTH_SUFFIX.len());
    input.extend_from_slice(kh);
    input.extend_from_slice(INTRO_AUTH_SUFFIX);
    sha1(&input)
}

/// Decrypted body of an INTRODUCE cell
///
/// ```text
/// VER(1) | RP address(4) | RP port(2) | RP identity(20)
///        | KLEN(2) | RP onion key(KLEN) | cookie(20) | g^x(128)
/// ```
#[derive(Debug, Clone)]
pub struct IntroducePayload {
    pub rendezvous_address: Ipv4Addr,
    pub rendezvous_port: u16,
    pub rendezvous_identity: [u8; IDENTITY_LEN],
    pub rendezvous_onion_key: RsaPublicKey,
    pub cookie: [u8; COOKIE_LEN],
    pub dh_public: Vec<u8>,
}

impl IntroducePayload {
    /// Describe a rendezvous at `rendezvous_point`
    pub fn new(rendezvous_point: &Router, cookie: [u8; COOKIE_LEN], dh_public: &[u8]) -> Self {
        Self {
            rendezvous_address: rendezvous_point.address,
            rendezvous_port: rendezvous_point.or_port,
            rendezvous_identity: rendezvous_point.fingerprint,
            rendezvous_onion_key: rendezvous_point.onion_key.clone(),
            cookie,
            dh_public: dh_public.to_vec(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let key = public_key_der(&self.rendezvous_onion_key)?;
        let mut out = Vec::with_capacity(1 + 4 + 2 + IDENTITY_LEN + 2 + key.len() + COOKIE_LEN + DH_LEN);
        out.push(INTRODUCE_VERSION);
        out.extend_from_slice(&self.rendezvous_address.octets());
        out.extend_from_slice(&self.rendezvous_port.to_be_bytes());
        out.extend_from_slice(&self.rendezvous_identity);
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(&key);
        out.extend_from_slice(&self.cookie);
        out.extend_from_slice(&self.dh_public);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let short = || TorError::ProtocolError(format!("INTRODUCE payload of {} bytes too short", data.len()));
        if data.first() != Some(&INTRODUCE_VERSION) {
            return Err(TorError::ProtocolError(format!(
                "Unsupported INTRODUCE version {:?}",
                data.first()
            )));
        }
        let fixed = 1 + 4 + 2 + IDENTITY_LEN + 2;
        if data.len() < fixed {
            return Err(short());
        }
        let rendezvous_address = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
        let rendezvous_port = u16::from_be_bytes([data[5], data[6]]);
        let mut rendezvous_identity = [0u8; IDENTITY_LEN];
        rendezvous_identity.copy_from_slice(&data[7..7 + IDENTITY_LEN]);
        let key_len = u16::from_be_bytes([data[fixed - 2], data[fixed - 1]]) as usize;

        let rest = &data[fixed..];
        if rest.len() < key_len + COOKIE_LEN + DH_LEN {
            return Err(short());
        }
        let rendezvous_onion_key = RsaPublicKey::from_pkcs1_der(&rest[..key_len])
            .map_err(|e| TorError::ProtocolError(format!("Bad rendezvous onion key: {}", e)))?;
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&rest[key_len..key_len + COOKIE_LEN]);
        let dh_public = rest[key_len + COOKIE_LEN..key_len + COOKIE_LEN + DH_LEN].to_vec();

        Ok(Self {
            rendezvous_address,
            rendezvous_port,
            rendezvous_identity,
            rendezvous_onion_key,
            cookie,
            dh_public,
        })
    }

    /// Router record for the rendezvous point named in the payload
    pub fn rendezvous_point(&self) -> Router {
        Router {
            nickname: format!("rp-{}", hex::encode(&self.rendezvous_identity[..4])),
            fingerprint: self.rendezvous_identity,
            address: self.rendezvous_address,
            or_port: self.rendezvous_port,
            onion_key: self.rendezvous_onion_key.clone(),
            flags: RouterFlags {
                running: true,
                valid: true,
                ..RouterFlags::default()
            },
            bandwidth: 0,
            exit_policy: ExitPolicy::default(),
        }
    }
}
