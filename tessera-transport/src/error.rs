use crate::codec::SerializationError;
use std::time::Duration;
use thiserror::Error;

/// Collective protocol failures. None of them is recoverable: once a rank
/// sees one the collective order is broken and the run has to stop.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Rank {from} announced {expected} bytes but sent {actual}")]
    SizeMismatch {
        from: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Rank {rank} stalled for {timeout:?} waiting on rank {peer}")]
    Stalled {
        rank: usize,
        peer: usize,
        timeout: Duration,
    },

    #[error("Rank {0} is no longer reachable")]
    Disconnected(usize),

    #[error("Rank {0} is not a member of this communicator")]
    NotMember(usize),

    #[error("Root {root} is outside a communicator of size {size}")]
    InvalidRoot { root: usize, size: usize },

    #[error("Expected {expected} parts, got {actual}")]
    PartCount { expected: usize, actual: usize },

    #[error("Failed to start rank {0}")]
    Spawn(usize),

    #[error("Rank {0} panicked")]
    RankPanicked(usize),
}
