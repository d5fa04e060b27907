//! Per-connection message dispatch: `have`, `request_block`, `block_data`,
//! `choke`, and `unchoke` handling for one established [`PeerConnection`].

use crate::connection::PeerConnection;
use crate::protocol::PeerMessage;
use crate::BlockId;

use super::PeerShared;

/// Runs until the connection closes or a read fails, then removes all
/// trace of the remote peer from `shared`.
pub async fn run(mut conn: PeerConnection, shared: PeerShared) {
    let remote_id = conn.remote_id().to_string();
    loop {
        match conn.recv().await {
            Ok(message) => handle_message(&remote_id, message, &shared).await,
            Err(e) => {
                log::info!("Connection to {} closed: {}", remote_id, e);
                break;
            }
        }
    }
    cleanup(&remote_id, &shared).await;
}

async fn handle_message(remote_id: &str, message: PeerMessage, shared: &PeerShared) {
    match message {
        PeerMessage::Have { blocks } => {
            shared
                .blocks
                .update_peer_blocks(remote_id.to_string(), blocks.into_iter().collect())
                .await;
        }
        PeerMessage::RequestBlock { block_id } => {
            handle_request_block(remote_id, block_id, shared).await;
        }
        PeerMessage::BlockData { block_id, bytes } => {
            handle_block_data(remote_id, block_id, bytes, shared).await;
        }
        PeerMessage::Choke => {
            if let Some(link) = shared.links.lock().await.get(remote_id) {
                link.set_choked_by_remote(true);
            }
        }
        PeerMessage::Unchoke => {
            if let Some(link) = shared.links.lock().await.get(remote_id) {
                link.set_choked_by_remote(false);
            }
        }
    }
}

/// Serves a block request if `remote_id` is currently unchoked by us and we
/// hold the block; otherwise the request is silently dropped, per the
/// choke policy.
async fn handle_request_block(remote_id: &str, block_id: BlockId, shared: &PeerShared) {
    let link = match shared.links.lock().await.get(remote_id).cloned() {
        Some(link) => link,
        None => return,
    };
    if !link.unchoked_by_us() {
        log::debug!(
            "Dropping request for block {} from choked peer {}",
            block_id,
            remote_id
        );
        return;
    }
    match shared.blocks.get_block(block_id).await {
        Some(bytes) => {
            if let Err(e) = link.send(PeerMessage::BlockData { block_id, bytes }).await {
                log::debug!("Failed to send block {} to {}: {}", block_id, remote_id, e);
            }
        }
        None => log::debug!("{} requested block {} we don't have", remote_id, block_id),
    }
}

async fn handle_block_data(remote_id: &str, block_id: BlockId, bytes: Vec<u8>, shared: &PeerShared) {
    shared.in_flight.lock().await.remove(&block_id);
    match shared.blocks.add_block(block_id, bytes).await {
        Ok(true) => {
            log::info!("Acquired block {} from {}", block_id, remote_id);
            broadcast_have(shared, block_id).await;
        }
        Ok(false) => {}
        Err(e) => log::warn!("Rejected block {} from {}: {}", block_id, remote_id, e),
    }
}

/// Announces a newly acquired block to every currently connected peer, so
/// rarity information converges faster than the request loop's periodic
/// tracker `UPDATE_BLOCKS` alone would allow.
async fn broadcast_have(shared: &PeerShared, block_id: BlockId) {
    let links = shared.links.lock().await.clone();
    for link in links.values() {
        let _ = link.send(PeerMessage::Have { blocks: vec![block_id] }).await;
    }
}

async fn cleanup(remote_id: &str, shared: &PeerShared) {
    shared.links.lock().await.remove(remote_id);
    shared.blocks.forget_peer(remote_id).await;
    shared
        .in_flight
        .lock()
        .await
        .retain(|_, holder| holder != remote_id);
}
