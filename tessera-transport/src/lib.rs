//! Collective messaging between the ranks of a partitioned run.

pub mod codec;
pub mod collective;
pub mod comm;
pub mod error;
pub mod local;

pub use codec::SerializationError;
pub use comm::Communicator;
pub use error::TransportError;
pub use local::{Cluster, LocalComm, DEFAULT_STALL_TIMEOUT};
