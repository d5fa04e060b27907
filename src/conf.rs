//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::DEFAULT_BLOCK_LEN;

/// Configuration for a peer process: its tracker, listening address, and the
/// two periodic loops' cadences.
#[derive(Clone, Debug)]
pub struct PeerConf {
    /// Address of the tracker this peer registers with.
    pub tracker_addr: SocketAddr,

    /// The address this peer's accept loop binds to for inbound peer
    /// connections.
    pub listen_addr: SocketAddr,

    /// The directory completed downloads are written into.
    pub downloads_dir: PathBuf,

    /// The size, in bytes, of a block. All blocks are this size except
    /// possibly the last one in a file.
    pub block_size: u32,

    /// How often the request loop refreshes peers and re-selects blocks.
    /// ~5s per the design.
    pub request_loop_interval: Duration,

    /// How often the unchoke loop recomputes who may pull from us. ~10s per
    /// the design.
    pub unchoke_loop_interval: Duration,

    /// Bound on how long an outbound connection attempt may take before
    /// being treated as a silent failure, retried next request cycle.
    pub connect_timeout: Duration,

    /// Size of the fixed-unchoked set (up to 4 per the design).
    pub max_fixed_unchoked: usize,

    /// Size of the optimistic-unchoked set (at most 1 per the design).
    pub max_optimistic_unchoked: usize,
}

impl PeerConf {
    /// Returns a configuration with reasonable defaults, except for the
    /// tracker address, listen address, and downloads directory, as it is
    /// not sensible to guess those for the user.
    pub fn new(
        tracker_addr: SocketAddr,
        listen_addr: SocketAddr,
        downloads_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tracker_addr,
            listen_addr,
            downloads_dir: downloads_dir.into(),
            block_size: DEFAULT_BLOCK_LEN,
            request_loop_interval: Duration::from_secs(5),
            unchoke_loop_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
            max_fixed_unchoked: 4,
            max_optimistic_unchoked: 1,
        }
    }
}

/// Configuration for the tracker process.
#[derive(Clone, Debug)]
pub struct TrackerConf {
    /// The address the tracker's accept loop binds to.
    pub listen_addr: SocketAddr,
}

impl TrackerConf {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }
}
