//! The file-system side of seeding and reassembling a file.
//!
//! These two operations are treated as the only points where the engine
//! touches the disk directly; the CLI/bootstrap layer above decides which
//! path to seed from and where to place completed downloads. Mirrors the
//! teacher's async `tokio::fs` usage (see `disk/io.rs`), but unlike the
//! teacher's piece-reassembly write buffer, MiniBit blocks are written
//! whole, independently, with no intermediate hashing stage, since piece
//! integrity is out of scope.

use std::path::Path;

use crate::error::Result;
use crate::{block_count, block_len, Block};

/// Reads the file at `path` off disk and splits it into blocks of
/// `block_size` bytes (the last block may be shorter). Used by the seeder
/// bootstrap path.
pub async fn read_file_into_blocks(path: &Path, block_size: u32) -> Result<Vec<Block>> {
    let data = tokio::fs::read(path).await?;
    let file_len = data.len() as u64;
    let count = block_count(file_len, block_size);
    log::info!(
        "Read {} bytes from {:?}, split into {} blocks of {} bytes",
        file_len,
        path,
        count,
        block_size
    );

    let mut blocks = Vec::with_capacity(count as usize);
    for id in 0..count {
        let len = block_len(file_len, block_size, id) as usize;
        let start = id as usize * block_size as usize;
        let end = start + len;
        blocks.push(Block {
            id,
            data: data[start..end].to_vec(),
        });
    }
    Ok(blocks)
}

/// Writes blocks, ordered by id, to `path`, producing a file whose length
/// is the sum of the block lengths rather than rounded up to a multiple of
/// `block_size`.
///
/// Precondition: the caller has already verified the block set is complete
/// (see [`crate::block_manager::BlockManager::is_complete`]); this function
/// does not check for gaps.
pub async fn write_blocks_to_file(path: &Path, mut blocks: Vec<Block>) -> Result<()> {
    blocks.sort_unstable_by_key(|b| b.id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = Vec::new();
    for block in &blocks {
        out.extend_from_slice(&block.data);
    }
    log::info!("Writing {} bytes to {:?}", out.len(), path);
    tokio::fs::write(path, out).await?;
    Ok(())
}
