//! MiniBit is a cooperative file-distribution engine modeled on BitTorrent.
//!
//! A file is split into fixed-size blocks and disseminated among peers that
//! register their inventory with a central [`tracker`]. Peers pick blocks to
//! request with a rarest-first strategy ([`block_manager`]) and decide who
//! they serve with a simplified tit-for-tat choke policy ([`choke`]).

#[macro_use]
extern crate serde_derive;

pub mod block_manager;
pub mod choke;
pub mod conf;
pub mod connection;
pub mod error;
pub mod framing;
pub mod io;
pub mod peer;
pub mod protocol;
pub mod tracker;

/// The index of a block within a file, `0..block_count`.
pub type BlockId = u32;

/// A peer's stable identifier within a swarm, e.g. a random UUID-shaped
/// token chosen at startup.
pub type PeerId = String;

/// The logical identifier of a shared file. Peers downloading or seeding the
/// same `FileName` form a swarm. There is no content hash: identity is by
/// name alone, per the engine's non-goals.
pub type FileName = String;

/// This is the only block length we're dealing with (except for possibly the
/// last block, which may be shorter). 16 KiB, the widely used BitTorrent
/// default.
pub const DEFAULT_BLOCK_LEN: u32 = 0x4000;

/// A single block of a file: its index and owned byte contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub data: Vec<u8>,
}

/// Returns the number of blocks a file of `file_len` bytes is split into,
/// given `block_size`. All but the last block are exactly `block_size`
/// bytes; the last may be shorter.
pub fn block_count(file_len: u64, block_size: u32) -> u32 {
    if file_len == 0 {
        return 0;
    }
    let block_size = block_size as u64;
    ((file_len + block_size - 1) / block_size) as u32
}

/// Returns the length in bytes of the block at `index`, given the total file
/// length and nominal block size.
///
/// # Panics
///
/// Panics if `index` is out of range for a file of this length.
pub fn block_len(file_len: u64, block_size: u32, index: BlockId) -> u32 {
    let offset = index as u64 * block_size as u64;
    assert!(offset < file_len, "block index {} out of range", index);
    let remaining = file_len - offset;
    remaining.min(block_size as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count_exact_multiple() {
        assert_eq!(block_count(2 * 0x4000, 0x4000), 2);
    }

    #[test]
    fn test_block_count_uneven() {
        let overlap = 234;
        assert_eq!(block_count(2 * 0x4000 + overlap, 0x4000), 3);
    }

    #[test]
    fn test_block_count_empty() {
        assert_eq!(block_count(0, 0x4000), 0);
    }

    #[test]
    fn test_block_len() {
        let overlap = 234;
        let len = 2 * 0x4000 + overlap;
        assert_eq!(block_len(len, 0x4000, 0), 0x4000);
        assert_eq!(block_len(len, 0x4000, 1), 0x4000);
        assert_eq!(block_len(len, 0x4000, 2), overlap);
    }

    #[test]
    #[should_panic]
    fn test_block_len_invalid_index_panics() {
        block_len(2 * 0x4000, 0x4000, 2);
    }
}
