//! The peer engine: three concurrent loops built on top of
//! [`crate::connection::PeerConnection`], [`crate::block_manager`], and
//! [`crate::choke`].
//!
//! - the accept loop takes inbound connections and hands each to a message
//!   loop task (see [`message_loop`])
//! - the request loop periodically refreshes swarm membership from the
//!   tracker, dials newly discovered peers, and issues rarest-first block
//!   requests
//! - the unchoke loop periodically recomputes who may pull from us
//!
//! All three loops, plus every message loop task, share one [`PeerShared`]
//! handle; none of them ever holds another's lock across an `.await` it
//! doesn't need to, so they only ever contend briefly.

mod message_loop;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use crate::block_manager::{BlockManager, SharedBlockManager};
use crate::choke::UnchokeManager;
use crate::conf::PeerConf;
use crate::connection::{PeerConnection, PeerLink};
use crate::error::Result;
use crate::protocol::PeerMessage;
use crate::tracker::client::TrackerClient;
use crate::{io, BlockId, FileName, PeerId};

/// State shared by the accept loop, request loop, unchoke loop, and every
/// per-connection message loop task.
#[derive(Clone)]
struct PeerShared {
    own_id: PeerId,
    file_name: FileName,
    blocks: SharedBlockManager,
    choke: Arc<Mutex<UnchokeManager>>,
    links: Arc<Mutex<HashMap<PeerId, PeerLink>>>,
    /// Maps a block id requested this request-tick to the peer asked, so a
    /// single tick doesn't send two requests for the same block. Cleared at
    /// the start of every tick (scoped to "this cycle" per spec §4.5 step
    /// 4) rather than held across ticks, so a request a remote silently
    /// dropped (the choke-drop path) is simply retried next cycle instead of
    /// blocking that block id forever.
    in_flight: Arc<Mutex<HashMap<BlockId, PeerId>>>,
}

/// A running peer engine. Dropping this does not stop the engine; call
/// [`PeerHandle::shutdown`] for a clean stop.
pub struct PeerHandle {
    pub blocks: SharedBlockManager,
    shutdown: watch::Sender<bool>,
}

impl PeerHandle {
    /// Signals all three loops to stop after their current iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Polls until every block has been acquired.
    pub async fn wait_until_complete(&self) {
        while !self.blocks.is_complete().await {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Reconstructs the file from acquired blocks and writes it to `path`.
    /// Fails with [`crate::error::Error::IncompleteFile`] if called before
    /// completion.
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        let blocks = self.blocks.reconstruct_file().await?;
        io::write_blocks_to_file(path, blocks).await
    }
}

/// Starts seeding `file_path` under `file_name`.
pub async fn seed(
    conf: PeerConf,
    own_id: PeerId,
    file_name: FileName,
    file_path: &Path,
) -> Result<PeerHandle> {
    let file_blocks = io::read_file_into_blocks(file_path, conf.block_size).await?;
    let file_len: u64 = file_blocks.iter().map(|b| b.data.len() as u64).sum();
    let mut manager = BlockManager::new(file_len, conf.block_size);
    manager.load_from_file(file_blocks);
    start(conf, own_id, file_name, manager).await
}

/// Starts downloading `file_name`, whose total length must be known ahead
/// of time (e.g. supplied out of band, since there is no metadata file to
/// fetch it from).
pub async fn download(
    conf: PeerConf,
    own_id: PeerId,
    file_name: FileName,
    file_len: u64,
) -> Result<PeerHandle> {
    let manager = BlockManager::new(file_len, conf.block_size);
    start(conf, own_id, file_name, manager).await
}

async fn start(
    conf: PeerConf,
    own_id: PeerId,
    file_name: FileName,
    manager: BlockManager,
) -> Result<PeerHandle> {
    let blocks = SharedBlockManager::new(manager);
    let listener = TcpListener::bind(conf.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    log::info!("Peer {} listening on {}", own_id, local_addr);

    let tracker = Arc::new(TrackerClient::new(conf.tracker_addr, own_id.clone()));
    let my_block_ids: HashSet<BlockId> = blocks.my_block_ids().await.into_iter().collect();
    tracker
        .register(file_name.clone(), local_addr, &my_block_ids)
        .await?;

    let shared = PeerShared {
        own_id: own_id.clone(),
        file_name,
        blocks: blocks.clone(),
        choke: Arc::new(Mutex::new(UnchokeManager::new(
            conf.max_fixed_unchoked,
            conf.max_optimistic_unchoked,
        ))),
        links: Arc::new(Mutex::new(HashMap::new())),
        in_flight: Arc::new(Mutex::new(HashMap::new())),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx.clone()));
    tokio::spawn(request_loop(
        shared.clone(),
        Arc::clone(&tracker),
        conf.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(unchoke_loop(shared, conf, shutdown_rx));

    Ok(PeerHandle {
        blocks,
        shutdown: shutdown_tx,
    })
}

async fn accept_loop(listener: TcpListener, shared: PeerShared, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let shared = shared.clone();
                        let own_id = shared.own_id.clone();
                        tokio::spawn(async move {
                            match PeerConnection::handshake_inbound(stream, addr, &own_id).await {
                                Ok(conn) => adopt_connection(conn, shared).await,
                                Err(e) => log::debug!("Inbound handshake with {} failed: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => log::warn!("Accept error: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("Peer {} accept loop stopping", shared.own_id);
                    break;
                }
            }
        }
    }
}

/// Registers a newly handshaken connection, announces our inventory to it,
/// and runs its message loop until it disconnects.
async fn adopt_connection(conn: PeerConnection, shared: PeerShared) {
    let remote_id = conn.remote_id().to_string();
    let link = conn.link();
    shared.links.lock().await.insert(remote_id.clone(), link.clone());

    let my_blocks = shared.blocks.my_block_ids().await;
    if link.send(PeerMessage::Have { blocks: my_blocks }).await.is_err() {
        shared.links.lock().await.remove(&remote_id);
        return;
    }

    message_loop::run(conn, shared).await;
}

async fn request_loop(
    shared: PeerShared,
    tracker: Arc<TrackerClient>,
    conf: PeerConf,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(conf.request_loop_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = request_tick(&shared, &tracker, &conf).await {
                    log::warn!("Peer {} request tick failed: {}", shared.own_id, e);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("Peer {} request loop stopping", shared.own_id);
                    break;
                }
            }
        }
    }
}

async fn request_tick(shared: &PeerShared, tracker: &TrackerClient, conf: &PeerConf) -> Result<()> {
    let my_blocks: HashSet<BlockId> = shared.blocks.my_block_ids().await.into_iter().collect();
    tracker.update_blocks(shared.file_name.clone(), &my_blocks).await?;

    let peers = tracker.get_peers(shared.file_name.clone()).await?;
    for info in peers {
        if info.peer_id == shared.own_id {
            continue;
        }
        let already_known = shared.links.lock().await.contains_key(&info.peer_id);
        shared
            .blocks
            .update_peer_blocks(info.peer_id.clone(), info.blocks.iter().copied().collect())
            .await;
        if already_known {
            continue;
        }
        connect_to_peer(shared.clone(), info.peer_id, info.address.0, conf.connect_timeout);
    }

    if shared.blocks.is_complete().await {
        return Ok(());
    }

    let rarest = shared.blocks.get_rarest_missing_blocks().await;
    let links = shared.links.lock().await.clone();
    let mut in_flight = shared.in_flight.lock().await;
    // Scoped to this cycle only (spec §4.5 step 4: "no in-flight request for
    // this id was sent *this cycle*"). A request dropped silently by a
    // choked remote (message_loop's choke-drop path) never clears this
    // entry any other way, so carrying it across cycles would strand that
    // block forever; starting fresh each tick means it's simply re-requested
    // next cycle instead.
    in_flight.clear();
    for block_id in rarest {
        if in_flight.contains_key(&block_id) {
            continue;
        }
        for (peer_id, link) in links.iter() {
            if link.choked_by_remote() {
                continue;
            }
            let peer_blocks = shared.blocks.get_peer_blocks(peer_id).await;
            if !peer_blocks.contains(&block_id) {
                continue;
            }
            if link.send(PeerMessage::RequestBlock { block_id }).await.is_ok() {
                in_flight.insert(block_id, peer_id.clone());
            }
            break;
        }
    }
    Ok(())
}

/// Dials an outbound connection to a newly discovered peer. A failure here
/// (timeout, refused connection, failed handshake) is not fatal to the
/// engine: the peer simply stays absent from `links` and is retried on the
/// next request tick as long as the tracker keeps reporting it.
fn connect_to_peer(shared: PeerShared, peer_id: PeerId, addr: SocketAddr, connect_timeout: Duration) {
    let own_id = shared.own_id.clone();
    tokio::spawn(async move {
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::debug!("Connect to {} ({}) failed: {}", peer_id, addr, e);
                return;
            }
            Err(_) => {
                log::debug!("Connect to {} ({}) timed out", peer_id, addr);
                return;
            }
        };
        match PeerConnection::handshake_outbound(stream, addr, &own_id).await {
            Ok(conn) => adopt_connection(conn, shared).await,
            Err(e) => log::debug!("Handshake with {} ({}) failed: {}", peer_id, addr, e),
        }
    });
}

async fn unchoke_loop(shared: PeerShared, conf: PeerConf, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(conf.unchoke_loop_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => unchoke_tick(&shared).await,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    log::info!("Peer {} unchoke loop stopping", shared.own_id);
                    break;
                }
            }
        }
    }
}

async fn unchoke_tick(shared: &PeerShared) {
    let my_blocks: HashSet<BlockId> = shared.blocks.my_block_ids().await.into_iter().collect();
    let links = shared.links.lock().await.clone();

    let mut interested = Vec::new();
    for peer_id in links.keys() {
        let their_blocks = shared.blocks.get_peer_blocks(peer_id).await;
        if my_blocks.difference(&their_blocks).next().is_some() {
            interested.push(peer_id.clone());
        }
    }

    let decision = {
        let mut choke = shared.choke.lock().await;
        choke.evaluate_peers(&interested)
    };

    for peer_id in decision.to_choke {
        if let Some(link) = links.get(&peer_id) {
            link.set_unchoked_by_us(false);
            let _ = link.send(PeerMessage::Choke).await;
        }
    }
    for peer_id in decision.to_unchoke {
        if let Some(link) = links.get(&peer_id) {
            link.set_unchoked_by_us(true);
            let _ = link.send(PeerMessage::Unchoke).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    fn fast_conf(tracker_addr: SocketAddr) -> PeerConf {
        let mut conf = PeerConf::new(tracker_addr, "127.0.0.1:0".parse().unwrap(), ".");
        conf.request_loop_interval = StdDuration::from_millis(30);
        conf.unchoke_loop_interval = StdDuration::from_millis(30);
        conf.connect_timeout = StdDuration::from_secs(1);
        conf.block_size = 4;
        conf
    }

    #[tokio::test]
    async fn a_leecher_downloads_a_complete_file_from_a_single_seeder() {
        let tracker_conf = crate::conf::TrackerConf::new("127.0.0.1:0".parse().unwrap());
        let tracker_handle = tracker::spawn(tracker_conf).await.unwrap();
        let tracker_addr = tracker_handle.local_addr;
        std::mem::forget(tracker_handle);

        let dir = tempdir().unwrap();
        let src = dir.path().join("source.bin");
        let content: Vec<u8> = (0..37u8).collect();
        tokio::fs::write(&src, &content).await.unwrap();

        let seeder_conf = fast_conf(tracker_addr);
        let seeder = seed(
            seeder_conf,
            "seeder".to_string(),
            "file.bin".to_string(),
            &src,
        )
        .await
        .unwrap();

        let leecher_conf = fast_conf(tracker_addr);
        let leecher = download(
            leecher_conf,
            "leecher".to_string(),
            "file.bin".to_string(),
            content.len() as u64,
        )
        .await
        .unwrap();

        tokio::time::timeout(StdDuration::from_secs(5), leecher.wait_until_complete())
            .await
            .expect("leecher did not complete in time");

        let dst = dir.path().join("out.bin");
        leecher.save_to(&dst).await.unwrap();
        let rebuilt = tokio::fs::read(&dst).await.unwrap();
        assert_eq!(rebuilt, content);

        seeder.shutdown();
        leecher.shutdown();
    }
}
