//! Hybrid asymmetric encryption
//!
//! The RSA block carries a fresh 16-byte symmetric key followed by the
//! first bytes of the message; whatever does not fit is AES-CTR encrypted
//! under that key and appended.
//!
//! ```text
//! RSA-OAEP(K[16] | M1) | AES-CTR(K, M2)
//! ```

use crate::error::{Result, TorError};
use crate::protocol::crypto::{CtrCipher, KEY_LEN};
use rand::{CryptoRng, RngCore};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use zeroize::Zeroize;

/// Bytes of overhead added by OAEP with SHA-1
pub const OAEP_OVERHEAD: usize = 42;

/// Message bytes that travel inside the RSA block for a key of `modulus_len` bytes
pub fn first_chunk_len(modulus_len: usize) -> usize {
    modulus_len.saturating_sub(OAEP_OVERHEAD + KEY_LEN)
}

/// Encrypt `data` to `public_key` using `symmetric_key` for the overflow
pub fn asym_encrypt<R: RngCore + CryptoRng>(
    rng: &mut R,
    public_key: &RsaPublicKey,
    symmetric_key: &[u8; KEY_LEN],
    data: &[u8],
) -> Result<Vec<u8>> {
    let modulus_len = public_key.size();
    let m1_len = first_chunk_len(modulus_len);
    if m1_len == 0 {
        return Err(TorError::CryptoError(format!(
            "RSA key of {} bytes too small for hybrid encryption",
            modulus_len
        )));
    }
    let split = data.len().min(m1_len);

    let mut block = Vec::with_capacity(KEY_LEN + split);
    block.extend_from_slice(symmetric_key);
    block.extend_from_slice(&data[..split]);

    let mut out = public_key.encrypt(rng, Oaep::new::<Sha1>(), &block)?;
    block.zeroize();

    if data.len() > split {
        let mut cipher = CtrCipher::new(symmetric_key);
        out.extend_from_slice(&cipher.process_to_vec(&data[split..]));
    }
    Ok(out)
}

/// Reverse [`asym_encrypt`]
pub fn asym_decrypt(private_key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>> {
    let modulus_len = private_key.size();
    if data.len() < modulus_len {
        return Err(TorError::CryptoError(format!(
            "Hybrid ciphertext of {} bytes shorter than one {}-byte RSA block",
            data.len(),
            modulus_len
        )));
    }

    let mut block = private_key.decrypt(Oaep::new::<Sha1>(), &data[..modulus_len])?;
    if block.len() < KEY_LEN {
        block.zeroize();
        return Err(TorError::CryptoError("RSA block lacks symmetric key".into()));
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&block[..KEY_LEN]);

    let mut out = block[KEY_LEN..].to_vec();
    if data.len() > modulus_len {
        let mut cipher = CtrCipher::new(&key);
        out.extend_from_slice(&cipher.process_to_vec(&data[modulus_len..]));
    }
    key.zeroize();
    block.zeroize();
    Ok(out)
}
