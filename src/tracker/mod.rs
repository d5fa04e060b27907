//! The tracker: accepts TCP connections from peers and serves `REGISTER`,
//! `GET_PEERS`, and `UPDATE_BLOCKS`. Holds per-file membership behind a
//! single lock, serializing every read and write the way the design
//! requires.

pub mod client;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::Framed;

use crate::conf::TrackerConf;
use crate::error::{Error, Result};
use crate::framing::JsonCodec;
use crate::protocol::{Address, PeerInfo, TrackerRequest, TrackerResponse};
use crate::{BlockId, FileName, PeerId};

/// One peer's entry in a file's membership map.
#[derive(Clone, Debug)]
struct MemberEntry {
    address: SocketAddr,
    blocks: HashSet<BlockId>,
}

/// `FileName -> PeerId -> MemberEntry`. A `PeerId` appears under at most one
/// `FileName` at a time: `REGISTER` for a new file first removes any entry
/// the peer had elsewhere, preserving the "one file per peer" invariant.
#[derive(Default)]
struct TrackerState {
    files: HashMap<FileName, HashMap<PeerId, MemberEntry>>,
}

impl TrackerState {
    fn register(
        &mut self,
        peer_id: PeerId,
        file_name: FileName,
        address: SocketAddr,
        blocks: HashSet<BlockId>,
    ) {
        self.remove_peer_everywhere(&peer_id);
        self.files
            .entry(file_name)
            .or_default()
            .insert(peer_id, MemberEntry { address, blocks });
    }

    fn get_peers(&self, file_name: &str, requester: &str) -> Vec<PeerInfo> {
        self.files
            .get(file_name)
            .map(|members| {
                members
                    .iter()
                    .filter(|(peer_id, _)| peer_id.as_str() != requester)
                    .map(|(peer_id, entry)| PeerInfo {
                        peer_id: peer_id.clone(),
                        address: Address(entry.address),
                        blocks: entry.blocks.iter().copied().collect(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn update_blocks(
        &mut self,
        peer_id: &str,
        file_name: &str,
        blocks: HashSet<BlockId>,
    ) -> Result<()> {
        let entry = self
            .files
            .get_mut(file_name)
            .and_then(|members| members.get_mut(peer_id))
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "peer {} is not registered under file {}",
                    peer_id, file_name
                ))
            })?;
        entry.blocks = blocks;
        Ok(())
    }

    /// Removes `peer_id` from every file's member map, e.g. on disconnect.
    fn remove_peer_everywhere(&mut self, peer_id: &str) {
        for members in self.files.values_mut() {
            members.remove(peer_id);
        }
    }
}

/// A handle used to stop a running tracker.
pub struct TrackerHandle {
    /// The address the tracker ended up bound to; the same as
    /// `conf.listen_addr` unless that address used the ephemeral port 0.
    pub local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

impl TrackerHandle {
    pub fn shutdown(self) {
        // a send failure just means the tracker already stopped on its own
        let _ = self.shutdown.send(());
    }
}

/// Binds a listener and serves the tracker protocol until
/// [`TrackerHandle::shutdown`] is called or a fatal bind error occurs.
///
/// Returns the handle immediately; the accept loop runs on the current
/// Tokio runtime via `tokio::spawn`.
pub async fn spawn(conf: TrackerConf) -> Result<TrackerHandle> {
    let listener = TcpListener::bind(conf.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    log::info!("Tracker listening on {}", local_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let state = Arc::new(Mutex::new(TrackerState::default()));

    tokio::spawn(accept_loop(listener, state, shutdown_rx));

    Ok(TrackerHandle {
        local_addr,
        shutdown: shutdown_tx,
    })
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<Mutex<TrackerState>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        log::info!("Accepted connection from {}", addr);
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                log::info!("Connection {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("Accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                log::info!("Tracker shutting down");
                break;
            }
        }
    }
}

/// Serves one client connection until it disconnects or sends malformed
/// JSON. On any read error the peer registered from this connection (if
/// any) is removed from every file's member map before returning, per the
/// design's failure semantics.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<Mutex<TrackerState>>,
) -> Result<()> {
    let mut link = Framed::new(stream, JsonCodec::<TrackerRequest>::new());
    let mut registered_peer_id: Option<PeerId> = None;

    let result = async {
        while let Some(request) = link.next().await {
            let request = match request {
                Ok(request) => request,
                Err(Error::Malformed(reason)) => {
                    log::warn!("Malformed request from {}: {}", addr, reason);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            let response = {
                let mut state = state.lock().await;
                dispatch(&mut state, request, &mut registered_peer_id)
            };
            link.send(response).await?;
        }
        Ok(())
    }
    .await;

    if let Some(peer_id) = &registered_peer_id {
        let mut state = state.lock().await;
        state.remove_peer_everywhere(peer_id);
        log::info!("Removed peer {} ({}) from tracker state", peer_id, addr);
    }

    result
}

fn dispatch(
    state: &mut TrackerState,
    request: TrackerRequest,
    registered_peer_id: &mut Option<PeerId>,
) -> TrackerResponse {
    match request {
        TrackerRequest::Register {
            peer_id,
            file_name,
            address,
            blocks,
        } => {
            log::debug!(
                "REGISTER peer={} file={} blocks={}",
                peer_id,
                file_name,
                blocks.len()
            );
            *registered_peer_id = Some(peer_id.clone());
            state.register(peer_id, file_name, address.0, blocks.into_iter().collect());
            TrackerResponse::ok()
        }
        TrackerRequest::GetPeers { peer_id, file_name } => {
            log::debug!("GET_PEERS peer={} file={}", peer_id, file_name);
            TrackerResponse::peers(state.get_peers(&file_name, &peer_id))
        }
        TrackerRequest::UpdateBlocks {
            peer_id,
            file_name,
            blocks,
        } => {
            log::debug!(
                "UPDATE_BLOCKS peer={} file={} blocks={}",
                peer_id,
                file_name,
                blocks.len()
            );
            match state.update_blocks(&peer_id, &file_name, blocks.into_iter().collect()) {
                Ok(()) => TrackerResponse::ok(),
                Err(e) => TrackerResponse::error(e.to_string()),
            }
        }
        TrackerRequest::Unknown { command } => {
            log::warn!("Unknown command {:?} from {:?}", command, registered_peer_id);
            TrackerResponse::error("unknown_command")
        }
    }
}
