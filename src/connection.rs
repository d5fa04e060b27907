//! `PeerConnection`: a framed, bidirectional link to one remote peer, plus
//! the per-link choke state.
//!
//! A connection starts with the handshake exchange (§4.2): the initiator
//! sends a [`Handshake`] first, the responder echoes one back. Either side
//! tears down the link on a mismatched peer id or on timeout. After that,
//! the link switches to framing [`PeerMessage`]s, reusing the handshake
//! codec's read/write buffers the way the teacher's `PeerSession::start`
//! swaps `HandshakeCodec` for `PeerCodec` via `Framed::into_parts` /
//! `FramedParts::from_parts`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, FramedParts};

use crate::error::{Error, Result};
use crate::framing::JsonCodec;
use crate::protocol::{Handshake, PeerMessage};
use crate::PeerId;

type MessageSink = SplitSink<Framed<TcpStream, JsonCodec<PeerMessage>>, PeerMessage>;
type MessageStream = SplitStream<Framed<TcpStream, JsonCodec<PeerMessage>>>;

/// Bound on how long we wait for the peer's side of the handshake before
/// giving up on the connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A cheaply cloneable handle to the sending half and choke flags of a
/// [`PeerConnection`], usable from any task that doesn't own the receiving
/// half. The request loop and unchoke loop hold one of these per remote
/// peer; only the message loop task holds the full [`PeerConnection`].
#[derive(Clone)]
pub struct PeerLink {
    remote_id: PeerId,
    addr: SocketAddr,
    sink: Arc<Mutex<MessageSink>>,
    choked_by_remote: Arc<AtomicBool>,
    unchoked_by_us: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl PeerLink {
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serializes, frames, and writes `message`, atomically with respect to
    /// any other concurrent call to `send` on this connection.
    pub async fn send(&self, message: PeerMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        let mut sink = self.sink.lock().await;
        sink.send(message).await
    }

    /// Idempotent; safe to call from any task sharing this connection.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn choked_by_remote(&self) -> bool {
        self.choked_by_remote.load(Ordering::Acquire)
    }

    pub fn set_choked_by_remote(&self, choked: bool) {
        self.choked_by_remote.store(choked, Ordering::Release);
    }

    pub fn unchoked_by_us(&self) -> bool {
        self.unchoked_by_us.load(Ordering::Acquire)
    }

    pub fn set_unchoked_by_us(&self, unchoked: bool) {
        self.unchoked_by_us.store(unchoked, Ordering::Release);
    }
}

/// A framed link to one remote peer: a [`PeerLink`] for sending plus the
/// exclusively-owned receiving half.
///
/// Only the task that owns a `PeerConnection` calls [`PeerConnection::recv`];
/// everyone else who needs to send or inspect choke state clones
/// [`PeerConnection::link`] instead.
pub struct PeerConnection {
    link: PeerLink,
    stream: MessageStream,
}

impl PeerConnection {
    /// Performs the outbound side of the handshake: send first, then wait
    /// for the peer's reply.
    pub async fn handshake_outbound(
        stream: TcpStream,
        addr: SocketAddr,
        own_id: &str,
    ) -> Result<Self> {
        let mut handshake_link = Framed::new(stream, JsonCodec::<Handshake>::new());
        log::debug!("Sending handshake to {}", addr);
        handshake_link.send(Handshake::new(own_id.to_string())).await?;
        Self::finish_handshake(handshake_link, addr).await
    }

    /// Performs the inbound side of the handshake: wait for the initiator's
    /// handshake, then reply with our own.
    pub async fn handshake_inbound(
        stream: TcpStream,
        addr: SocketAddr,
        own_id: &str,
    ) -> Result<Self> {
        let mut handshake_link = Framed::new(stream, JsonCodec::<Handshake>::new());
        let peer_handshake = Self::recv_handshake(&mut handshake_link, addr).await?;
        log::debug!("Replying to handshake from {}", addr);
        handshake_link.send(Handshake::new(own_id.to_string())).await?;
        Self::from_handshake_link(handshake_link, addr, peer_handshake.peer_id)
    }

    async fn finish_handshake(
        mut handshake_link: Framed<TcpStream, JsonCodec<Handshake>>,
        addr: SocketAddr,
    ) -> Result<Self> {
        let peer_handshake = Self::recv_handshake(&mut handshake_link, addr).await?;
        Self::from_handshake_link(handshake_link, addr, peer_handshake.peer_id)
    }

    async fn recv_handshake(
        handshake_link: &mut Framed<TcpStream, JsonCodec<Handshake>>,
        addr: SocketAddr,
    ) -> Result<Handshake> {
        let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake_link.next())
            .await
            .map_err(|_| {
                log::warn!("Handshake with {} timed out", addr);
                Error::Protocol("handshake timed out".to_string())
            })?;
        match frame {
            Some(handshake) => handshake,
            None => Err(Error::Disconnected),
        }
    }

    /// Switches a handshake-framed link to a `PeerMessage`-framed one,
    /// reusing the handshake codec's buffered bytes, splits it into an
    /// independently-lockable sink and an owned stream, and wraps both in
    /// a `PeerConnection`.
    fn from_handshake_link(
        handshake_link: Framed<TcpStream, JsonCodec<Handshake>>,
        addr: SocketAddr,
        remote_id: PeerId,
    ) -> Result<Self> {
        let old_parts = handshake_link.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, JsonCodec::<PeerMessage>::new());
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let framed = Framed::from_parts(new_parts);
        let (sink, stream) = framed.split();
        Ok(Self {
            link: PeerLink {
                remote_id,
                addr,
                sink: Arc::new(Mutex::new(sink)),
                // A freshly established link starts choked: the remote must
                // send an explicit `unchoke` before we may request from it,
                // matching the choke model's default-deny posture.
                choked_by_remote: Arc::new(AtomicBool::new(true)),
                unchoked_by_us: Arc::new(AtomicBool::new(false)),
                closed: Arc::new(AtomicBool::new(false)),
            },
            stream,
        })
    }

    pub fn remote_id(&self) -> &str {
        self.link.remote_id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.link.addr()
    }

    /// A cloneable handle other tasks can use to send on and inspect this
    /// connection without taking over its receiving half.
    pub fn link(&self) -> PeerLink {
        self.link.clone()
    }

    /// Serializes, frames, and writes `message`, atomically with respect to
    /// any other concurrent call to `send` on this connection.
    pub async fn send(&self, message: PeerMessage) -> Result<()> {
        self.link.send(message).await
    }

    /// Blocks until a full frame is read; fails with `Disconnected` on a
    /// clean EOF or `Malformed`/`Protocol`/`Network` on any other error.
    pub async fn recv(&mut self) -> Result<PeerMessage> {
        match self.stream.next().await {
            Some(msg) => msg,
            None => Err(Error::Disconnected),
        }
    }

    /// Idempotent; safe to call from any task sharing this connection.
    pub fn close(&self) {
        self.link.close()
    }

    pub fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    pub fn choked_by_remote(&self) -> bool {
        self.link.choked_by_remote()
    }

    pub fn set_choked_by_remote(&self, choked: bool) {
        self.link.set_choked_by_remote(choked)
    }

    pub fn unchoked_by_us(&self) -> bool {
        self.link.unchoked_by_us()
    }

    pub fn set_unchoked_by_us(&self, unchoked: bool) {
        self.link.set_unchoked_by_us(unchoked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept_result, connect_result) = tokio::join!(listener.accept(), connect);
        let (server_stream, client_addr) = accept_result.unwrap();
        let client_stream = connect_result.unwrap();
        (client_stream, server_stream, client_addr, addr)
    }

    #[tokio::test]
    async fn handshake_succeeds_and_exchanges_peer_ids() {
        let (client_stream, server_stream, _client_addr, server_addr) =
            connected_pair().await;

        let client_fut =
            PeerConnection::handshake_outbound(client_stream, server_addr, "client-id");
        let server_fut =
            PeerConnection::handshake_inbound(server_stream, server_addr, "server-id");

        let (client_conn, server_conn) = tokio::join!(client_fut, server_fut);
        let client_conn = client_conn.unwrap();
        let server_conn = server_conn.unwrap();

        assert_eq!(client_conn.remote_id(), "server-id");
        assert_eq!(server_conn.remote_id(), "client-id");
    }

    #[tokio::test]
    async fn send_then_recv_round_trips_a_message() {
        let (client_stream, server_stream, _client_addr, server_addr) =
            connected_pair().await;
        let (client_conn, server_conn) = tokio::join!(
            PeerConnection::handshake_outbound(client_stream, server_addr, "client-id"),
            PeerConnection::handshake_inbound(server_stream, server_addr, "server-id"),
        );
        let client_conn = client_conn.unwrap();
        let mut server_conn = server_conn.unwrap();

        client_conn
            .send(PeerMessage::Have { blocks: vec![0, 1, 2] })
            .await
            .unwrap();
        let received = server_conn.recv().await.unwrap();
        assert_eq!(received, PeerMessage::Have { blocks: vec![0, 1, 2] });
    }

    #[tokio::test]
    async fn recv_on_closed_socket_reports_disconnected() {
        let (client_stream, server_stream, _client_addr, server_addr) =
            connected_pair().await;
        let (client_conn, server_conn) = tokio::join!(
            PeerConnection::handshake_outbound(client_stream, server_addr, "client-id"),
            PeerConnection::handshake_inbound(server_stream, server_addr, "server-id"),
        );
        let client_conn = client_conn.unwrap();
        let mut server_conn = server_conn.unwrap();

        drop(client_conn);
        let result = server_conn.recv().await;
        assert!(matches!(result, Err(Error::Disconnected)));
    }

    #[tokio::test]
    async fn handshake_inbound_times_out_if_no_handshake_arrives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent_client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        // shorten effective wait by relying on the 5s timeout constant
        // being exercised directly; this test only checks the failure path
        // terminates with a Protocol error, not the exact duration.
        let result = tokio::time::timeout(
            Duration::from_secs(6),
            PeerConnection::handshake_inbound(server_stream, addr, "server-id"),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
