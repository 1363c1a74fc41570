//! Core engine for a peer-to-peer file-sharing client speaking the ADC
//! ("dialect A") and NMDC ("dialect B") hub/transfer protocols.
//!
//! This crate implements the subsystems described in DESIGN.md: the hub
//! protocol state machines for both dialects, the peer connection state
//! machine and slot/token arbitration, the download scheduler, the upload
//! slot manager, the shared-tree index (Bloom + TTH + file-list XML +
//! search), and the Tiger-tree hash pipeline. Favorites persistence,
//! hublist fetching, GeoIP, UPnP and UI are out of scope; this crate only
//! exposes the hooks those collaborators would need.

#![recursion_limit = "256"]

pub mod bloom;
pub mod conf;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod hash;
pub mod hub;
pub mod ids;
pub mod net;
pub mod peer;
pub mod queue;
pub mod scheduler;
pub mod search_udp;
pub mod share;
pub mod slots;
pub mod user;
pub mod wire;

pub use ids::{Cid, Pid, Sid, TthValue};

/// A 192-bit digest, the common shape backing [`ids::Cid`], [`ids::Pid`] and
/// [`ids::TthValue`].
pub type Digest192 = [u8; 24];

/// The Tiger-tree leaf size before the block-size promotion described in
/// [`hash`] (1 KiB).
pub(crate) const TTH_LEAF_LEN: u64 = 1024;

/// The canonical mini-slot / initial transfer chunk floor (64 KiB).
pub(crate) const MIN_CHUNK_LEN: u64 = 64 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_24_bytes() {
        // 192 bits == 24 bytes; every id type in this crate rides on this.
        assert_eq!(std::mem::size_of::<Digest192>(), 24);
    }
}
