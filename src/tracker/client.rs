//! `TrackerClient`: the peer-side half of the tracker protocol.
//!
//! Holds one long-lived TCP connection to the tracker for the client's
//! entire lifetime, established lazily on the first request and reused by
//! every subsequent `REGISTER`/`GET_PEERS`/`UPDATE_BLOCKS` call. This is the
//! connection the tracker's "remove on disconnect" failure semantics (§3/§7)
//! assume: a peer that never closes this socket stays registered, and the
//! tracker only learns of its departure when the socket actually drops. A
//! fresh connection per request would make every call look like a
//! connect-then-immediately-disconnect from the tracker's point of view,
//! wiping the registration moments after `REGISTER` created it.
//!
//! If the connection is found dead on use (the tracker restarted, a
//! mid-flight network blip), one reconnect-and-retry is attempted
//! transparently; a second failure is surfaced to the caller, who per the
//! design treats a `TrackerRejection`/network error as "retry next cycle".

use std::collections::HashSet;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::framing::JsonCodec;
use crate::protocol::{Address, PeerInfo, TrackerRequest, TrackerResponse};
use crate::{BlockId, FileName, PeerId};

type TrackerLink = Framed<TcpStream, JsonCodec<TrackerResponse>>;

/// A peer's handle to the tracker, holding one persistent connection for
/// the peer's lifetime.
pub struct TrackerClient {
    tracker_addr: SocketAddr,
    peer_id: PeerId,
    link: Mutex<Option<TrackerLink>>,
}

impl TrackerClient {
    pub fn new(tracker_addr: SocketAddr, peer_id: PeerId) -> Self {
        Self {
            tracker_addr,
            peer_id,
            link: Mutex::new(None),
        }
    }

    /// Announces our listening address and current inventory for
    /// `file_name`, replacing any prior registration under a different
    /// file name.
    pub async fn register(
        &self,
        file_name: FileName,
        own_listen_addr: SocketAddr,
        blocks: &HashSet<BlockId>,
    ) -> Result<()> {
        let request = TrackerRequest::Register {
            peer_id: self.peer_id.clone(),
            file_name,
            address: Address(own_listen_addr),
            blocks: blocks.iter().copied().collect(),
        };
        match self.request(request).await? {
            TrackerResponse::Ok { .. } => Ok(()),
            TrackerResponse::Error { reason, .. } => Err(Error::TrackerRejection(reason)),
            TrackerResponse::Peers { .. } => Err(Error::Protocol(
                "tracker replied with a peer list to a REGISTER request".to_string(),
            )),
        }
    }

    /// Fetches the current swarm membership for `file_name`, excluding
    /// ourselves.
    pub async fn get_peers(&self, file_name: FileName) -> Result<Vec<PeerInfo>> {
        let request = TrackerRequest::GetPeers {
            peer_id: self.peer_id.clone(),
            file_name,
        };
        match self.request(request).await? {
            TrackerResponse::Peers { peers } => Ok(peers),
            TrackerResponse::Error { reason, .. } => Err(Error::TrackerRejection(reason)),
            TrackerResponse::Ok { .. } => Err(Error::Protocol(
                "tracker replied with a bare ok to a GET_PEERS request".to_string(),
            )),
        }
    }

    /// Publishes a fresh inventory snapshot for `file_name`.
    pub async fn update_blocks(
        &self,
        file_name: FileName,
        blocks: &HashSet<BlockId>,
    ) -> Result<()> {
        let request = TrackerRequest::UpdateBlocks {
            peer_id: self.peer_id.clone(),
            file_name,
            blocks: blocks.iter().copied().collect(),
        };
        match self.request(request).await? {
            TrackerResponse::Ok { .. } => Ok(()),
            TrackerResponse::Error { reason, .. } => Err(Error::TrackerRejection(reason)),
            TrackerResponse::Peers { .. } => Err(Error::Protocol(
                "tracker replied with a peer list to an UPDATE_BLOCKS request".to_string(),
            )),
        }
    }

    /// Sends `request` over the persistent connection, reconnecting once and
    /// retrying if the connection turns out to be dead.
    async fn request(&self, request: TrackerRequest) -> Result<TrackerResponse> {
        let mut link = self.link.lock().await;
        if link.is_some() {
            if let Ok(response) = Self::send_and_recv(link.as_mut().unwrap(), request.clone()).await {
                return Ok(response);
            }
            log::debug!("Tracker connection to {} dropped, reconnecting", self.tracker_addr);
            *link = None;
        }
        *link = Some(Self::connect(self.tracker_addr).await?);
        Self::send_and_recv(link.as_mut().unwrap(), request).await
    }

    async fn connect(tracker_addr: SocketAddr) -> Result<TrackerLink> {
        let stream = TcpStream::connect(tracker_addr).await?;
        Ok(Framed::new(stream, JsonCodec::new()))
    }

    async fn send_and_recv(link: &mut TrackerLink, request: TrackerRequest) -> Result<TrackerResponse> {
        link.send(request).await?;
        match link.next().await {
            Some(response) => response,
            None => Err(Error::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker;
    use pretty_assertions::assert_eq;

    async fn spawn_test_tracker() -> SocketAddr {
        let conf = crate::conf::TrackerConf::new("127.0.0.1:0".parse().unwrap());
        let handle = tracker::spawn(conf).await.unwrap();
        let addr = handle.local_addr;
        std::mem::forget(handle);
        addr
    }

    #[tokio::test]
    async fn register_then_get_peers_round_trips_over_real_sockets() {
        let tracker_addr = spawn_test_tracker().await;

        let seeder = TrackerClient::new(tracker_addr, "seeder".to_string());
        let leecher = TrackerClient::new(tracker_addr, "leecher".to_string());

        let seeder_addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        seeder
            .register(
                "movie.mkv".to_string(),
                seeder_addr,
                &[0, 1, 2].into_iter().collect(),
            )
            .await
            .unwrap();

        let peers = leecher.get_peers("movie.mkv".to_string()).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "seeder");
        assert_eq!(peers[0].address.0, seeder_addr);
    }

    #[tokio::test]
    async fn update_blocks_for_an_unregistered_peer_is_rejected() {
        let tracker_addr = spawn_test_tracker().await;

        let client = TrackerClient::new(tracker_addr, "ghost".to_string());
        let result = client
            .update_blocks("file".to_string(), &HashSet::new())
            .await;
        assert!(matches!(result, Err(Error::TrackerRejection(_))));
    }

    #[tokio::test]
    async fn register_survives_across_many_calls_on_the_same_persistent_connection() {
        // Guards against the regression where a fresh connection per call
        // made the tracker see a connect-then-disconnect after every
        // REGISTER, silently wiping the registration.
        let tracker_addr = spawn_test_tracker().await;
        let seeder = TrackerClient::new(tracker_addr, "seeder".to_string());
        let seeder_addr: SocketAddr = "127.0.0.1:7002".parse().unwrap();

        seeder
            .register("movie.mkv".to_string(), seeder_addr, &[0].into_iter().collect())
            .await
            .unwrap();

        // Several more round-trips over what must be the same connection.
        for n in 1..=5u32 {
            seeder
                .update_blocks("movie.mkv".to_string(), &(0..=n).collect())
                .await
                .unwrap();
        }

        let leecher = TrackerClient::new(tracker_addr, "leecher".to_string());
        let peers = leecher.get_peers("movie.mkv".to_string()).await.unwrap();
        assert_eq!(peers.len(), 1, "seeder must still be registered");
        assert_eq!(peers[0].blocks.len(), 6);
    }
}
