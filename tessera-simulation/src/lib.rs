//! Components that keep per-process simulation state consistent with a
//! shared partition: halo fields, object migration, load balancing and
//! quad tree groups.

pub mod balancer;
pub mod group;
pub mod halo;
pub mod migration;
pub mod storage;

pub use balancer::{BalanceAction, BalanceError, Coloring, LoadBalancer};
pub use group::{GroupComm, GroupError, HierarchicalGroups};
pub use halo::{Boundary, HaloError, HaloField, Neighbor};
pub use migration::{Arrival, Dispatch, MigrationError, MigrationQueue};
pub use storage::{ContinuousStorage, FieldStorage, GridStorage, Overlap, StorageError};
