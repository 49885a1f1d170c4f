use crate::error::TransportError;

/// Blocking byte-level collectives over a fixed group of ranks.
///
/// Every member must issue the same collectives in the same order. Ranks
/// in arguments and results are ranks of this communicator, not of the
/// world it was split from.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sends `payloads[i]` to `neighbors[i]` and returns what each neighbor
    /// sent back, in the same order. Both sides must list each other.
    fn neighbor_exchange(
        &self,
        neighbors: &[usize],
        payloads: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Every rank's contribution, indexed by rank.
    fn all_gather(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Contributions indexed by rank at `root`, `None` elsewhere.
    fn gather(&self, root: usize, data: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, TransportError>;

    /// Hands `parts[i]` to rank `i`. `parts` is ignored except at `root`.
    fn scatter(&self, root: usize, parts: Vec<Vec<u8>>) -> Result<Vec<u8>, TransportError>;

    /// Returns `root`'s data everywhere. `data` is ignored except at `root`.
    fn broadcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>, TransportError>;

    fn barrier(&self) -> Result<(), TransportError> {
        self.all_gather(Vec::new()).map(|_| ())
    }

    /// Communicator over `members` (ranks of `self`), ordered by rank. Only
    /// the members call it.
    fn split(&self, members: &[usize]) -> Result<Self, TransportError>
    where
        Self: Sized;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    fn check_root(&self, root: usize) -> Result<(), TransportError> {
        if root >= self.size() {
            return Err(TransportError::InvalidRoot {
                root,
                size: self.size(),
            });
        }
        Ok(())
    }
}
