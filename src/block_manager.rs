//! Owns a peer's block bytes and its view of the swarm's rarity, and
//! implements rarest-first block selection.
//!
//! All mutable state lives behind a single internal lock
//! ([`BlockManager`] wraps a [`tokio::sync::RwLock`]-guarded inner struct
//! via its handle, [`SharedBlockManager`]), so the message loop (writer) and
//! the request loop (reader) never race, matching the design's "single
//! owner exposing narrow operations" rule.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{block_count, block_len, error::Result, BlockId, PeerId};

/// The block store and rarity map for one file. Not `Clone`; callers share
/// it via [`SharedBlockManager`].
pub struct BlockManager {
    file_len: u64,
    block_size: u32,
    block_count: u32,
    /// Blocks this peer possesses, keyed by id.
    my_blocks: HashMap<BlockId, Vec<u8>>,
    /// Last-known inventory of every remote peer we've heard from, via
    /// `have` announcements or tracker registrations.
    peer_block_map: HashMap<PeerId, HashSet<BlockId>>,
}

impl BlockManager {
    /// Creates an empty block manager for a file of `file_len` bytes split
    /// into blocks of `block_size` (the leecher path: starts with zero
    /// blocks).
    pub fn new(file_len: u64, block_size: u32) -> Self {
        Self {
            file_len,
            block_size,
            block_count: block_count(file_len, block_size),
            my_blocks: HashMap::new(),
            peer_block_map: HashMap::new(),
        }
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// The ids of all blocks we currently have, in no particular order.
    pub fn my_block_ids(&self) -> Vec<BlockId> {
        self.my_blocks.keys().copied().collect()
    }

    /// Inserts a block we already own (seeder bootstrap). Does not validate
    /// the id against `block_count`, as callers are expected to have
    /// derived it from `file_len`/`block_size` themselves.
    fn insert_owned_block(&mut self, id: BlockId, data: Vec<u8>) {
        debug_assert!(!data.is_empty());
        debug_assert!(id < self.block_count);
        self.my_blocks.insert(id, data);
    }

    /// Populates `my_blocks` with all blocks read from `blocks` (seeder
    /// bootstrap via [`crate::io::read_file_into_blocks`]).
    pub fn load_from_file(&mut self, blocks: Vec<crate::Block>) {
        for block in blocks {
            self.insert_owned_block(block.id, block.data);
        }
    }

    /// Inserts a newly received block if not already present; duplicates
    /// are silently ignored. Returns whether the block was newly added.
    pub fn add_block(&mut self, id: BlockId, data: Vec<u8>) -> Result<bool> {
        if id >= self.block_count {
            return Err(crate::error::Error::InvalidBlockId(id));
        }
        if self.my_blocks.contains_key(&id) {
            log::debug!("Duplicate block {} ignored", id);
            return Ok(false);
        }
        let expected_len = block_len(self.file_len, self.block_size, id);
        if data.len() as u32 != expected_len {
            log::warn!(
                "Block {} has length {}, expected {}",
                id,
                data.len(),
                expected_len
            );
        }
        self.my_blocks.insert(id, data);
        Ok(true)
    }

    pub fn have_block(&self, id: BlockId) -> bool {
        self.my_blocks.contains_key(&id)
    }

    pub fn get_block(&self, id: BlockId) -> Option<&[u8]> {
        self.my_blocks.get(&id).map(|v| v.as_slice())
    }

    /// True iff every block in `0..block_count` has been acquired.
    pub fn is_complete(&self) -> bool {
        self.my_blocks.len() as u32 == self.block_count
    }

    /// Overwrites the rarity-map entry for `peer_id` with its latest known
    /// inventory, observed via a `have` message or a tracker registration.
    pub fn update_peer_blocks(&mut self, peer_id: PeerId, blocks: HashSet<BlockId>) {
        self.peer_block_map.insert(peer_id, blocks);
    }

    /// Removes a peer's inventory entry, e.g. on disconnect.
    pub fn forget_peer(&mut self, peer_id: &str) {
        self.peer_block_map.remove(peer_id);
    }

    pub fn get_peer_blocks(&self, peer_id: &str) -> HashSet<BlockId> {
        self.peer_block_map
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Rarest-first selection: every block id we're missing, sorted
    /// ascending by global holder count (blocks no known peer has yet sort
    /// first, at count 0, and are simply unrequestable until a holder
    /// appears), with ties broken ascending by id for determinism.
    ///
    /// Recomputed fresh on every call; rarity can only be known up to date
    /// by not caching it, since `have` messages arrive continuously.
    pub fn get_rarest_missing_blocks(&self) -> Vec<BlockId> {
        let mut counts = HashMap::new();
        for blocks in self.peer_block_map.values() {
            for &id in blocks {
                *counts.entry(id).or_insert(0u32) += 1;
            }
        }

        let mut missing: Vec<(u32, BlockId)> = (0..self.block_count)
            .filter(|id| !self.my_blocks.contains_key(id))
            .map(|id| (*counts.get(&id).unwrap_or(&0), id))
            .collect();
        missing.sort_unstable();
        missing.into_iter().map(|(_, id)| id).collect()
    }

    /// Emits blocks in id order; the caller must check [`Self::is_complete`]
    /// first.
    pub fn reconstruct_file(&self) -> Result<Vec<crate::Block>> {
        if !self.is_complete() {
            return Err(crate::error::Error::IncompleteFile);
        }
        let mut ids: Vec<BlockId> = self.my_blocks.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids
            .into_iter()
            .map(|id| crate::Block {
                id,
                data: self.my_blocks[&id].clone(),
            })
            .collect())
    }
}

/// A cheaply cloneable handle to a shared, lock-guarded [`BlockManager`].
///
/// All mutations are serialized under the inner lock; callers never get a
/// raw `&BlockManager` out, per the design's "never leak raw references"
/// rule. Methods mirror `BlockManager`'s but take `&self` and are `async`.
#[derive(Clone)]
pub struct SharedBlockManager(Arc<RwLock<BlockManager>>);

impl SharedBlockManager {
    pub fn new(manager: BlockManager) -> Self {
        Self(Arc::new(RwLock::new(manager)))
    }

    pub async fn block_count(&self) -> u32 {
        self.0.read().await.block_count()
    }

    pub async fn is_complete(&self) -> bool {
        self.0.read().await.is_complete()
    }

    pub async fn my_block_ids(&self) -> Vec<BlockId> {
        self.0.read().await.my_block_ids()
    }

    pub async fn have_block(&self, id: BlockId) -> bool {
        self.0.read().await.have_block(id)
    }

    pub async fn get_block(&self, id: BlockId) -> Option<Vec<u8>> {
        self.0.read().await.get_block(id).map(|b| b.to_vec())
    }

    pub async fn add_block(&self, id: BlockId, data: Vec<u8>) -> Result<bool> {
        self.0.write().await.add_block(id, data)
    }

    pub async fn update_peer_blocks(&self, peer_id: PeerId, blocks: HashSet<BlockId>) {
        self.0.write().await.update_peer_blocks(peer_id, blocks)
    }

    pub async fn forget_peer(&self, peer_id: &str) {
        self.0.write().await.forget_peer(peer_id)
    }

    pub async fn get_peer_blocks(&self, peer_id: &str) -> HashSet<BlockId> {
        self.0.read().await.get_peer_blocks(peer_id)
    }

    pub async fn get_rarest_missing_blocks(&self) -> Vec<BlockId> {
        self.0.read().await.get_rarest_missing_blocks()
    }

    pub async fn reconstruct_file(&self) -> Result<Vec<crate::Block>> {
        self.0.read().await.reconstruct_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager_with(file_len: u64, block_size: u32) -> BlockManager {
        BlockManager::new(file_len, block_size)
    }

    #[test]
    fn rarest_first_ties_break_by_ascending_id() {
        let mgr = manager_with(3 * 4, 4);
        // no peer has announced anything: all three blocks tie at count 0
        assert_eq!(mgr.get_rarest_missing_blocks(), vec![0, 1, 2]);
    }

    #[test]
    fn rarest_first_prefers_lower_global_count() {
        let mut mgr = manager_with(4 * 4, 4);
        let mut peer_a_blocks = HashSet::new();
        peer_a_blocks.insert(0);
        peer_a_blocks.insert(1);
        mgr.update_peer_blocks("peer-a".to_string(), peer_a_blocks);

        let mut peer_b_blocks = HashSet::new();
        peer_b_blocks.insert(0);
        peer_b_blocks.insert(2);
        mgr.update_peer_blocks("peer-b".to_string(), peer_b_blocks);

        // block 0: count 2 (a, b); block 1: count 1 (a); block 2: count 1
        // (b); block 3: count 0 (nobody)
        assert_eq!(mgr.get_rarest_missing_blocks(), vec![3, 1, 2, 0]);
    }

    #[test]
    fn already_owned_blocks_are_excluded_from_selection() {
        let mut mgr = manager_with(2 * 4, 4);
        mgr.insert_owned_block(0, vec![1, 2, 3, 4]);
        assert_eq!(mgr.get_rarest_missing_blocks(), vec![1]);
    }

    #[test]
    fn add_block_ignores_duplicates() {
        let mut mgr = manager_with(4, 4);
        assert!(mgr.add_block(0, vec![1, 2, 3, 4]).unwrap());
        assert!(!mgr.add_block(0, vec![5, 6, 7, 8]).unwrap());
        // first write wins
        assert_eq!(mgr.get_block(0).unwrap(), &[1, 2, 3, 4]);
    }

    #[test]
    fn add_block_rejects_out_of_range_id() {
        let mut mgr = manager_with(4, 4);
        assert!(mgr.add_block(5, vec![1]).is_err());
    }

    #[test]
    fn is_complete_tracks_block_count() {
        let mut mgr = manager_with(2 * 4, 4);
        assert!(!mgr.is_complete());
        mgr.add_block(0, vec![1, 2, 3, 4]).unwrap();
        assert!(!mgr.is_complete());
        mgr.add_block(1, vec![5, 6, 7, 8]).unwrap();
        assert!(mgr.is_complete());
    }

    #[test]
    fn reconstruct_file_requires_completeness() {
        let mgr = manager_with(4, 4);
        assert!(mgr.reconstruct_file().is_err());
    }

    #[test]
    fn reconstruct_file_orders_blocks_by_id_and_preserves_uneven_last_block() {
        let mut mgr = manager_with(4 + 2, 4);
        mgr.add_block(1, vec![9, 9]).unwrap();
        mgr.add_block(0, vec![1, 2, 3, 4]).unwrap();
        let blocks = mgr.reconstruct_file().unwrap();
        assert_eq!(blocks[0].id, 0);
        assert_eq!(blocks[1].id, 1);
        assert_eq!(blocks[1].data, vec![9, 9]);
        let total: usize = blocks.iter().map(|b| b.data.len()).sum();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn shared_block_manager_serializes_concurrent_writers() {
        let shared = SharedBlockManager::new(manager_with(4 * 4, 4));
        let mut handles = Vec::new();
        for id in 0..4u32 {
            let shared = shared.clone();
            handles.push(tokio::spawn(async move {
                shared.add_block(id, vec![0, 0, 0, 0]).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(shared.is_complete().await);
    }
}
