//! Onion layering of relay cells
//!
//! ```text
//! outbound: seal(hops[target]) → encrypt target, target-1, …, 0
//! inbound:  decrypt 0 → check 0 → decrypt 1 → check 1 → …
//! ```
//!
//! Both functions are direction-agnostic: a client applies them to its
//! own hops, the answering side applies them to reversed hops.

use crate::error::{Result, TorError};
use crate::protocol::cell::Cell;
use crate::protocol::hop::Hop;

/// Seal a relay payload for `hops[target]` and add every layer up to it
pub fn layer(hops: &mut [Hop], target: usize, payload: &mut [u8; Cell::PAYLOAD_SIZE]) -> Result<()> {
    if target >= hops.len() {
        return Err(TorError::Internal(format!(
            "Relay cell addressed to hop {} of a {}-hop route",
            target,
            hops.len()
        )));
    }
    hops[target].seal(payload);
    for hop in hops[..=target].iter_mut().rev() {
        hop.encrypt_forward(payload);
    }
    Ok(())
}

/// Strip layers until a hop recognizes the payload; returns that hop's index
///
/// On failure every layer has been removed, so the payload holds what the
/// last hop would forward.
pub fn peel(hops: &mut [Hop], payload: &mut [u8; Cell::PAYLOAD_SIZE]) -> Result<usize> {
    for (index, hop) in hops.iter_mut().enumerate() {
        hop.decrypt_backward(payload);
        if hop.check(payload) {
            log::trace!("Relay cell recognized at hop {} ({})", index, hop.name());
            return Ok(index);
        }
    }
    Err(TorError::RelayCellNotRecognized { hops: hops.len() })
}
