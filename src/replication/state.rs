//! Replicator State Types

use std::fmt;

use crate::cloner::DatabasesCloner;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::oplog::Timestamp;

/// Top-level mode of the data replicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Not replicating; the only state `start` and `initial_sync` accept
    Uninitialized,
    /// Bootstrapping a full copy of the sync source's data
    InitialSync,
    /// Tailing and applying the sync source's oplog
    Steady,
    /// Resolving oplog divergence from the sync source
    Rollback,
}

impl fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicatorState::Uninitialized => "Uninitialized",
            ReplicatorState::InitialSync => "InitialSync",
            ReplicatorState::Steady => "Steady Replication",
            ReplicatorState::Rollback => "Rollback",
        };
        write!(f, "{}", name)
    }
}

/// Counters kept for one initial sync run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitialSyncStats {
    /// Documents fetched one-by-one to fill holes during apply
    pub fetched_missing_docs: u64,
    /// Oplog operations applied while catching up to the stop timestamp
    pub applied_ops: u64,
}

/// State held while an initial sync is in progress
///
/// Created on entry to `InitialSync` and destroyed on exit. The final
/// status latches first-failure-wins and the completion event fires at
/// most once.
pub(crate) struct InitialSyncState {
    /// Cloner for all databases included in the sync
    pub dbs_cloner: DatabasesCloner,
    /// Remote oplog head when the sync started
    pub begin_ts: Timestamp,
    /// Oplog position the applier must reach before the sync can finish,
    /// known once database cloning completes
    pub stop_ts: Option<Timestamp>,
    /// Fired on completion, successful or not
    pub finish_event: Event,
    /// Progress counters
    pub stats: InitialSyncStats,
    status: Option<Result<()>>,
}

impl InitialSyncState {
    pub fn new(dbs_cloner: DatabasesCloner, begin_ts: Timestamp, finish_event: Event) -> Self {
        Self {
            dbs_cloner,
            begin_ts,
            stop_ts: None,
            finish_event,
            stats: InitialSyncStats::default(),
            status: None,
        }
    }

    /// Latch the final status. The first decision wins; returns true when
    /// this call set it.
    pub fn set_status(&mut self, status: Result<()>) -> bool {
        if self.status.is_some() {
            return false;
        }
        self.status = Some(status);
        true
    }

    /// The latched status, if decided
    pub fn status(&self) -> Option<&Result<()>> {
        self.status.as_ref()
    }

    /// True once a failure has been latched
    pub fn failed(&self) -> bool {
        matches!(self.status, Some(Err(_)))
    }

    /// Latch a failure and fire the completion event
    pub fn fail(&mut self, error: Error) {
        if self.set_status(Err(error)) {
            self.finish_event.signal();
        }
    }

    /// Latch success and fire the completion event
    pub fn succeed(&mut self) {
        if self.set_status(Ok(())) {
            self.finish_event.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloner::ClonerFactory;
    use crate::remote::HostAndPort;
    use crate::testutil::{scripted_cloner_factory, ClonerBehavior, ScriptedRemote};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn dummy_state() -> InitialSyncState {
        let factory: ClonerFactory =
            scripted_cloner_factory(HashMap::new(), ClonerBehavior::Succeed);
        let cloner = DatabasesCloner::new(
            ScriptedRemote::new(),
            HostAndPort::new("primary", 27017),
            factory,
            Arc::new(|_| Box::pin(async {})),
        );
        InitialSyncState::new(cloner, Timestamp::new(1), Event::new())
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ReplicatorState::Steady.to_string(), "Steady Replication");
        assert_eq!(ReplicatorState::Uninitialized.to_string(), "Uninitialized");
    }

    #[tokio::test]
    async fn test_first_status_wins() {
        let mut state = dummy_state();
        state.fail(Error::Network("first".into()));
        state.fail(Error::Network("second".into()));
        state.succeed();
        assert_eq!(state.status(), Some(&Err(Error::Network("first".into()))));
        assert!(state.failed());
        assert!(state.finish_event.is_signaled());
    }

    #[tokio::test]
    async fn test_success_latches() {
        let mut state = dummy_state();
        state.succeed();
        state.fail(Error::Network("late".into()));
        assert_eq!(state.status(), Some(&Ok(())));
        assert!(!state.failed());
    }
}
