//! Directory collaborator
//!
//! The engine never fetches or verifies the consensus itself. A host
//! supplies a [`Directory`] that knows the usable routers and the
//! descriptors of hidden services.

use crate::error::{Result, TorError};
use crate::protocol::{sha1, Router};
use async_trait::async_trait;
use base32::Alphabet;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::RsaPublicKey;

/// Suffix of hidden-service host names
pub const ONION_SUFFIX: &str = ".onion";

/// Length of the base32 service identifier
pub const ONION_ID_LEN: usize = 16;

/// One introduction point of a hidden service
#[derive(Debug, Clone)]
pub struct IntroductionPoint {
    /// Router acting as introduction point
    pub router: Router,

    /// Key INTRODUCE1 payloads are encrypted to
    pub service_key: RsaPublicKey,
}

/// What a client needs to reach a hidden service
#[derive(Debug, Clone)]
pub struct RendezvousServiceDescriptor {
    /// Long-term service key; the onion address is derived from it
    pub service_key: RsaPublicKey,

    /// Introduction points, in the order the client tries them
    pub introduction_points: Vec<IntroductionPoint>,
}

impl RendezvousServiceDescriptor {
    /// Onion identifier this descriptor belongs to
    pub fn onion_id(&self) -> Result<String> {
        onion_id(&self.service_key)
    }
}

/// Source of routers and hidden-service descriptors
#[async_trait]
pub trait Directory: Send + Sync {
    /// Whether enough directory information is available to build circuits
    fn is_ready(&self) -> bool;

    /// Routers that may be used in circuits
    async fn valid_routers(&self) -> Result<Vec<Router>>;

    /// Descriptor of the service with the given 16-character identifier
    async fn service_descriptor(&self, onion_id: &str) -> Result<RendezvousServiceDescriptor>;

    /// Make a provided service reachable
    async fn publish_descriptor(&self, descriptor: RendezvousServiceDescriptor) -> Result<()> {
        let id = descriptor.onion_id()?;
        Err(TorError::Directory(format!(
            "This directory cannot publish descriptors ({})",
            id
        )))
    }
}

/// DER (PKCS#1) encoding of an RSA public key
pub fn public_key_der(key: &RsaPublicKey) -> Result<Vec<u8>> {
    Ok(key
        .to_pkcs1_der()
        .map_err(|e| TorError::CryptoError(format!("Key encoding: {}", e)))?
        .as_bytes()
        .to_vec())
}

/// SHA-1 of the DER-encoded key (PK_ID in INTRODUCE cells)
pub fn public_key_digest(key: &RsaPublicKey) -> Result<[u8; 20]> {
    Ok(sha1(&public_key_der(key)?))
}

/// 16-character base32 service identifier of a key
pub fn onion_id(key: &RsaPublicKey) -> Result<String> {
    let digest = public_key_digest(key)?;
    Ok(base32::encode(Alphabet::Rfc4648 { padding: false }, &digest[..10]).to_lowercase())
}

/// Full `.onion` host name of a key
pub fn onion_address(key: &RsaPublicKey) -> Result<String> {
    Ok(format!("{}{}", onion_id(key)?, ONION_SUFFIX))
}

/// Service identifier of a `.onion` host name, if it is one
///
/// Subdomains (`www.<id>.onion`) resolve to the same service.
pub fn parse_onion_host(host: &str) -> Option<String> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let stem = host.strip_suffix(ONION_SUFFIX)?;
    let id = stem.rsplit('.').next()?;
    let valid = id.len() == ONION_ID_LEN
        && base32::decode(Alphabet::Rfc4648 { padding: false }, &id.to_ascii_uppercase()).is_some();
    valid.then(|| id.to_string())
}
