//! Replication Coordinator Contract
//!
//! The coordinator owns cluster-wide concerns the replicator delegates:
//! sync source selection and blacklisting, the follower's advertised
//! position, and member state transitions.

use std::time::Instant;

use crate::oplog::Timestamp;
use crate::remote::HostAndPort;

/// Member states the replicator can request for this follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerMode {
    /// Normal replicating follower
    Secondary,
    /// Data may be inconsistent; catching up before serving reads
    Recovering,
    /// Resolving oplog divergence from the sync source
    Rollback,
}

/// Coordinator operations used by the data replicator
///
/// Calls are idempotent from the replicator's point of view and must not
/// block; implementations answer from in-memory cluster state.
pub trait ReplicationCoordinator: Send + Sync {
    /// Pick a sync source, honoring current blacklists. `None` when no
    /// candidate is available.
    fn choose_new_sync_source(&self) -> Option<HostAndPort>;

    /// Refuse `host` as a sync source until the deadline passes
    fn blacklist_sync_source(&self, host: &HostAndPort, until: Instant);

    /// Last optime this follower reported as applied
    fn get_my_last_optime(&self) -> Timestamp;

    /// Record a newly applied optime
    fn set_my_last_optime(&self, optime: Timestamp);

    /// Request a follower state transition; false when the transition is
    /// refused
    fn set_follower_mode(&self, mode: FollowerMode) -> bool;
}
