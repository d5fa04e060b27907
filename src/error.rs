//! Error types shared across the engine.
//!
//! These map onto the error kinds from the design: `Network` and `Malformed`
//! cover socket and framing failures, `Protocol` covers well-formed but
//! invalid messages, `TrackerRejection` covers an explicit `status: error`
//! response. `Shutdown` is not an error at all (it's a cooperative loop
//! exit) and so has no variant here.

use crate::BlockId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket I/O failure: connect, read, or write error, including
    /// unexpected EOF.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// A frame was received that isn't valid UTF-8 JSON, or is missing a
    /// mandatory field.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A structurally valid message was rejected because it violates
    /// protocol expectations (e.g. a bitfield sent out of order).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The tracker replied with `{"status": "error", ...}`.
    #[error("tracker rejected request: {0}")]
    TrackerRejection(String),

    /// The remote peer closed the connection (EOF with no data).
    #[error("peer disconnected")]
    Disconnected,

    /// A block index is outside `0..block_count` for the file in question.
    #[error("invalid block id {0}")]
    InvalidBlockId(BlockId),

    /// `reconstruct_file` was called before `is_complete()`.
    #[error("cannot reconstruct file: blocks still missing")]
    IncompleteFile,

    /// An internal mpsc/oneshot channel was dropped.
    #[error("internal channel closed")]
    ChannelClosed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
