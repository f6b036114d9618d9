//! Data Replicator State Machine
//!
//! Composes the oplog fetcher, oplog buffer, databases cloner, batch
//! applier, and reporter into the follower lifecycle: initial sync,
//! steady-state tailing, and the rollback hook.
//!
//! Every subtask completion funnels into `do_next_actions`, the single
//! place decisions are made. The internal mutex guards all replicator
//! state and is never held across remote calls, waits, or sleeps;
//! functions named `*_inlock` require it held.

mod state;


pub use state::{InitialSyncStats, ReplicatorState};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use crate::applier::{Applier, ApplierCompletionFn, ApplyFn};
use crate::cloner::{ClonerFactory, ClonerFinishFn, CollectionScanCloner, DatabasesCloner};
use crate::config::ReplicatorConfig;
use crate::coordinator::{FollowerMode, ReplicationCoordinator};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::fetcher::{Batch, BatchCallback, NextAction, OplogFetcher};
use crate::oplog::{entry_missing_id, entry_namespace, entry_timestamp, OplogBuffer, Timestamp};
use crate::remote::{Document, FindOptions, HostAndPort, Namespace, RemoteClient};
use crate::reporter::Reporter;
use crate::storage::StorageInterface;

use state::InitialSyncState;

/// Attempts before `initial_sync` gives up
const MAX_INITIAL_SYNC_ATTEMPTS: usize = 10;

/// Probe invoked when the sync source reports our start position is gone.
/// Returns true when a rollback was performed and tailing can resume.
pub type RollbackProbeFn = Arc<dyn Fn(&HostAndPort) -> bool + Send + Sync>;

/// Tunables and function hooks for the data replicator
#[derive(Clone)]
pub struct DataReplicatorOptions {
    /// Remote oplog namespace
    pub remote_oplog_ns: Namespace,
    /// Start position when no coordinator is configured
    pub start_optime: Timestamp,
    /// Sync source when no coordinator is configured
    pub sync_source: Option<HostAndPort>,
    /// Delay between sync source lookups
    pub sync_source_retry_wait: Duration,
    /// Delay between initial sync attempts
    pub initial_sync_retry_wait: Duration,
    /// Blacklist penalty after the source rolled its oplog past us
    pub blacklist_penalty_oplog_start_missing: Duration,
    /// Blacklist penalty after a network error
    pub blacklist_penalty_network_error: Duration,
    /// Oplog buffer capacity in bytes
    pub buffer_capacity_bytes: usize,
    /// External apply function
    pub applier_fn: ApplyFn,
    /// Rollback probe, defaults to "no rollback performed"
    pub rollback_probe: RollbackProbeFn,
}

impl DataReplicatorOptions {
    /// Options with built-in defaults and the given apply function
    pub fn new(applier_fn: ApplyFn) -> Self {
        let config = ReplicatorConfig::default();
        Self {
            remote_oplog_ns: Namespace::new("local", "oplog.rs"),
            start_optime: Timestamp::default(),
            sync_source: None,
            sync_source_retry_wait: config.source_retry_wait(),
            initial_sync_retry_wait: config.initial_sync_retry_wait(),
            blacklist_penalty_oplog_start_missing: config.oplog_start_missing_penalty(),
            blacklist_penalty_network_error: config.network_error_penalty(),
            buffer_capacity_bytes: config.oplog.buffer_capacity_bytes,
            applier_fn,
            rollback_probe: Arc::new(|_| false),
        }
    }

    /// Options derived from a loaded configuration
    pub fn from_config(config: &ReplicatorConfig, applier_fn: ApplyFn) -> Result<Self> {
        Ok(Self {
            remote_oplog_ns: config.oplog_namespace()?,
            start_optime: Timestamp::new(config.sync.start_optime),
            sync_source: config.sync_source()?,
            sync_source_retry_wait: config.source_retry_wait(),
            initial_sync_retry_wait: config.initial_sync_retry_wait(),
            blacklist_penalty_oplog_start_missing: config.oplog_start_missing_penalty(),
            blacklist_penalty_network_error: config.network_error_penalty(),
            buffer_capacity_bytes: config.oplog.buffer_capacity_bytes,
            applier_fn,
            rollback_probe: Arc::new(|_| false),
        })
    }
}

/// State guarded by the replicator's single mutex
struct Inner {
    state: ReplicatorState,
    sync_source: Option<HostAndPort>,
    fetcher: Option<OplogFetcher>,
    applier: Option<Applier>,
    applier_active: bool,
    fetcher_paused: bool,
    applier_paused: bool,
    reporter_paused: bool,
    reporter: Option<Reporter>,
    initial_sync: Option<InitialSyncState>,
    last_applied: Option<Timestamp>,
    last_fetched: Option<Timestamp>,
    do_shutdown: bool,
    on_shutdown: Option<Event>,
    last_initial_sync_stats: Option<InitialSyncStats>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ReplicatorState::Uninitialized,
            sync_source: None,
            fetcher: None,
            applier: None,
            applier_active: false,
            fetcher_paused: false,
            applier_paused: false,
            reporter_paused: false,
            reporter: None,
            initial_sync: None,
            last_applied: None,
            last_fetched: None,
            do_shutdown: false,
            on_shutdown: None,
            last_initial_sync_stats: None,
        }
    }
}

struct Core {
    opts: DataReplicatorOptions,
    remote: Arc<dyn RemoteClient>,
    coord: Option<Arc<dyn ReplicationCoordinator>>,
    storage: Arc<dyn StorageInterface>,
    cloner_factory: ClonerFactory,
    buffer: OplogBuffer,
    fail_sync_source: AtomicBool,
    inner: Mutex<Inner>,
    me: Weak<Core>,
}

/// Drives a follower through initial sync, steady-state replication, and
/// rollback against a remote sync source
#[derive(Clone)]
pub struct DataReplicator {
    core: Arc<Core>,
}

impl DataReplicator {
    /// Create a replicator using the built-in collection-scan cloner
    pub fn new(
        opts: DataReplicatorOptions,
        remote: Arc<dyn RemoteClient>,
        coord: Option<Arc<dyn ReplicationCoordinator>>,
        storage: Arc<dyn StorageInterface>,
    ) -> Self {
        let factory = CollectionScanCloner::factory(Arc::clone(&remote), Arc::clone(&storage));
        Self::with_cloner_factory(opts, remote, coord, storage, factory)
    }

    /// Create a replicator with a custom database cloner factory
    pub fn with_cloner_factory(
        opts: DataReplicatorOptions,
        remote: Arc<dyn RemoteClient>,
        coord: Option<Arc<dyn ReplicationCoordinator>>,
        storage: Arc<dyn StorageInterface>,
        cloner_factory: ClonerFactory,
    ) -> Self {
        let buffer_capacity = opts.buffer_capacity_bytes;
        let core = Arc::new_cyclic(|me| Core {
            opts,
            remote,
            coord,
            storage,
            cloner_factory,
            buffer: OplogBuffer::new(buffer_capacity),
            fail_sync_source: AtomicBool::new(false),
            inner: Mutex::new(Inner::new()),
            me: me.clone(),
        });
        Self { core }
    }

    /// Begin steady-state replication
    pub fn start(&self) -> Result<()> {
        {
            let mut inner = self.core.inner.lock();
            if inner.state != ReplicatorState::Uninitialized {
                return Err(Error::IllegalOperation(format!(
                    "already started in another state: {}",
                    inner.state
                )));
            }
            inner.state = ReplicatorState::Steady;
            inner.do_shutdown = false;
            inner.applier_paused = false;
            inner.fetcher_paused = false;
            inner.reporter_paused = false;
        }
        self.core.do_next_actions();
        Ok(())
    }

    /// Bootstrap a full copy of the sync source's data
    ///
    /// Clones every remote database while buffering the oplog from the
    /// sync start, then applies the buffered tail through the clone's stop
    /// point. Retries failed attempts up to the built-in limit and blocks
    /// until the sync is terminal. Returns the last applied timestamp.
    pub async fn initial_sync(&self) -> Result<Timestamp> {
        let started = Instant::now();
        {
            let mut inner = self.core.inner.lock();
            match inner.state {
                ReplicatorState::Uninitialized => {}
                ReplicatorState::InitialSync => {
                    return Err(Error::AlreadyInitialized(
                        "already doing initial sync; try resync".into(),
                    ));
                }
                other => {
                    return Err(Error::AlreadyInitialized(format!(
                        "cannot do initial sync in {} state",
                        other
                    )));
                }
            }
            inner.state = ReplicatorState::InitialSync;
            inner.do_shutdown = false;
            // The reporter stays paused for the duration of the sync.
            if let Some(reporter) = &inner.reporter {
                reporter.cancel();
            }
            inner.reporter_paused = true;
            inner.applier_paused = true;
        }

        let mut failed_attempts = 0;
        loop {
            match self.core.run_initial_sync_attempt().await {
                Ok(()) => break,
                Err(e) if e.is_canceled() => {
                    let mut inner = self.core.inner.lock();
                    if let Some(iss) = inner.initial_sync.take() {
                        inner.last_initial_sync_stats = Some(iss.stats);
                    }
                    inner.state = ReplicatorState::Uninitialized;
                    return Err(e);
                }
                Err(e) => {
                    failed_attempts += 1;
                    tracing::error!(
                        "initial sync attempt failed, attempts left: {}, cause: {}",
                        MAX_INITIAL_SYNC_ATTEMPTS - failed_attempts,
                        e
                    );
                    self.teardown_attempt().await;
                    tokio::time::sleep(self.core.opts.initial_sync_retry_wait).await;
                    if failed_attempts >= MAX_INITIAL_SYNC_ATTEMPTS {
                        let mut inner = self.core.inner.lock();
                        inner.state = ReplicatorState::Uninitialized;
                        tracing::error!(
                            "the maximum number of retries have been exhausted for initial sync"
                        );
                        return Err(Error::InitialSyncFailure(
                            "the maximum number of retries have been exhausted for initial sync"
                                .into(),
                        ));
                    }
                }
            }
        }

        // Success. Collect the attempt state but leave the fetcher running
        // so a subsequent `start` resumes tailing where the sync left off.
        let last_applied = {
            let mut inner = self.core.inner.lock();
            if let Some(iss) = inner.initial_sync.take() {
                inner.last_initial_sync_stats = Some(iss.stats);
            }
            inner.reporter_paused = false;
            inner.last_applied.unwrap_or_default()
        };
        tracing::info!("initial sync took {} ms", started.elapsed().as_millis());
        Ok(last_applied)
    }

    /// Drop local user data and run a fresh initial sync
    pub async fn resync(&self) -> Result<Timestamp> {
        self.shutdown().await?;
        self.core.storage.drop_user_databases().await?;
        let last_applied = self.initial_sync().await?;

        // Zero the tailing state so steady replication restarts from the
        // freshly synced position.
        let (fetcher, applier, reporter) = {
            let mut inner = self.core.inner.lock();
            (
                inner.fetcher.take(),
                inner.applier.take(),
                inner.reporter.take(),
            )
        };
        if let Some(fetcher) = &fetcher {
            fetcher.cancel();
            fetcher.wait().await;
        }
        if let Some(applier) = &applier {
            applier.cancel();
            applier.wait().await;
        }
        if let Some(reporter) = &reporter {
            reporter.cancel();
            reporter.wait().await;
        }
        {
            let mut inner = self.core.inner.lock();
            inner.applier_active = false;
            inner.last_applied = Some(last_applied);
            inner.last_fetched = Some(last_applied);
        }
        self.core.buffer.clear();
        Ok(last_applied)
    }

    /// Pause the applier, waiting for the in-flight batch to drain
    pub async fn pause(&self) {
        let applier = {
            let mut inner = self.core.inner.lock();
            inner.applier_paused = true;
            inner.applier.clone()
        };
        if let Some(applier) = applier {
            applier.wait().await;
        }
    }

    /// Unpause the fetcher and applier. With `wait`, blocks until the
    /// unpause has been scheduled.
    pub async fn resume(&self, wait: bool) -> Result<()> {
        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            {
                let mut inner = core.inner.lock();
                inner.fetcher_paused = false;
                inner.applier_paused = false;
            }
            core.do_next_actions();
        });
        if wait {
            handle
                .await
                .map_err(|e| Error::Executor(e.to_string()))?;
        }
        Ok(())
    }

    /// Wait for the current applier batch to drain, then pause. Returns
    /// the last applied timestamp.
    pub async fn flush_and_pause(&self) -> Timestamp {
        let applier = {
            let mut inner = self.core.inner.lock();
            inner.applier_paused = true;
            if inner.applier_active {
                inner.applier.clone()
            } else {
                None
            }
        };
        if let Some(applier) = applier {
            applier.wait().await;
        }
        self.core.inner.lock().last_applied.unwrap_or_default()
    }

    /// Cancel every subtask and block until no callback remains in flight
    ///
    /// Once it returns the replicator is quiesced and reset: a later
    /// `start` or `initial_sync` begins from a clean, empty-buffer state.
    pub async fn shutdown(&self) -> Result<()> {
        let event = Event::new();
        let (fetcher, applier, reporter, cloner) = {
            let mut inner = self.core.inner.lock();
            inner.on_shutdown = Some(event.clone());
            inner.do_shutdown = true;
            self.core.cancel_all_handles_inlock(&mut inner);
            (
                inner.fetcher.clone(),
                inner.applier.clone(),
                inner.reporter.clone(),
                inner.initial_sync.as_ref().map(|iss| iss.dbs_cloner.clone()),
            )
        };
        // Drain every subtask before the final wake-up so the checks below
        // cannot race their completion callbacks.
        if let Some(fetcher) = fetcher {
            fetcher.wait().await;
        }
        if let Some(applier) = applier {
            applier.wait().await;
        }
        if let Some(reporter) = reporter {
            reporter.wait().await;
        }
        if let Some(cloner) = cloner {
            cloner.wait().await;
        }
        // One wake-up guarantees the shutdown event fires even when
        // nothing was active.
        self.core.do_next_actions();
        event.wait().await;

        let mut inner = self.core.inner.lock();
        assert!(
            !self.core.any_active_handles_inlock(&inner),
            "subtask still active after shutdown"
        );
        inner.fetcher = None;
        inner.applier = None;
        inner.reporter = None;
        if let Some(iss) = inner.initial_sync.take() {
            inner.last_initial_sync_stats = Some(iss.stats);
        }
        inner.applier_active = false;
        inner.state = ReplicatorState::Uninitialized;
        inner.on_shutdown = None;
        drop(inner);
        self.core.buffer.clear();
        Ok(())
    }

    /// Trigger the reporter, if one is running
    pub fn slaves_have_progressed(&self) {
        let reporter = self.core.inner.lock().reporter.clone();
        if let Some(reporter) = reporter {
            reporter.trigger();
        }
    }

    /// Force every initial sync attempt to fail as if the sync source were
    /// invalid. Test hook.
    pub fn set_fail_initial_sync_with_bad_host(&self, enable: bool) {
        self.core.fail_sync_source.store(enable, Ordering::SeqCst);
    }

    /// Current replicator state
    pub fn state(&self) -> ReplicatorState {
        self.core.inner.lock().state
    }

    /// Current sync source, if one is selected
    pub fn sync_source(&self) -> Option<HostAndPort> {
        self.core.inner.lock().sync_source.clone()
    }

    /// Timestamp of the last applied operation
    pub fn last_applied(&self) -> Option<Timestamp> {
        self.core.inner.lock().last_applied
    }

    /// Timestamp of the last fetched operation
    pub fn last_fetched(&self) -> Option<Timestamp> {
        self.core.inner.lock().last_fetched
    }

    /// Number of buffered, not yet applied operations
    pub fn buffered_ops(&self) -> usize {
        self.core.buffer.len()
    }

    /// Serialized size of the buffered operations
    pub fn buffered_bytes(&self) -> usize {
        self.core.buffer.size_bytes()
    }

    /// Counters of the initial sync currently in progress
    pub fn initial_sync_progress(&self) -> Option<InitialSyncStats> {
        self.core.inner.lock().initial_sync.as_ref().map(|iss| iss.stats)
    }

    /// Counters of the most recently finished initial sync
    pub fn last_initial_sync_stats(&self) -> Option<InitialSyncStats> {
        self.core.inner.lock().last_initial_sync_stats
    }

    /// Human-readable summary of the replicator's state
    pub fn diagnostic_string(&self) -> String {
        format!("{}", self)
    }

    async fn teardown_attempt(&self) {
        let (fetcher, applier, cloner) = {
            let mut inner = self.core.inner.lock();
            let cloner = inner.initial_sync.take().map(|iss| {
                inner.last_initial_sync_stats = Some(iss.stats);
                iss.dbs_cloner
            });
            inner.applier_paused = true;
            (inner.fetcher.take(), inner.applier.take(), cloner)
        };
        if let Some(fetcher) = &fetcher {
            fetcher.cancel();
        }
        if let Some(applier) = &applier {
            applier.cancel();
        }
        if let Some(cloner) = &cloner {
            cloner.cancel();
        }
        if let Some(fetcher) = &fetcher {
            fetcher.wait().await;
        }
        if let Some(applier) = &applier {
            applier.wait().await;
        }
        if let Some(cloner) = &cloner {
            cloner.wait().await;
        }
        // The next attempt picks a fresh begin timestamp; stale buffered
        // entries from this one must not leak into it.
        let mut inner = self.core.inner.lock();
        inner.applier_active = false;
        inner.last_fetched = None;
        drop(inner);
        self.core.buffer.clear();
    }
}

impl fmt::Display for DataReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.inner.lock();
        write!(
            f,
            "DataReplicator {{ state: {}, sync source: {}, last fetched: {}, last applied: {}, buffered: {} ops / {} bytes",
            inner.state,
            inner
                .sync_source
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            inner.last_fetched.map(|t| t.to_string()).unwrap_or_else(|| "<none>".to_string()),
            inner.last_applied.map(|t| t.to_string()).unwrap_or_else(|| "<none>".to_string()),
            self.core.buffer.len(),
            self.core.buffer.size_bytes(),
        )?;
        if let Some(iss) = &inner.initial_sync {
            write!(
                f,
                ", initial sync: {{ begin: {}, stop: {}, applied ops: {}, fetched missing docs: {} }}",
                iss.begin_ts,
                iss.stop_ts.map(|t| t.to_string()).unwrap_or_else(|| "<unknown>".to_string()),
                iss.stats.applied_ops,
                iss.stats.fetched_missing_docs,
            )?;
        }
        write!(f, " }}")
    }
}

impl Core {
    /// The single decision point. Inspects state and schedules whatever
    /// comes next; every subtask completion ends up here.
    fn do_next_actions(&self) {
        let mut inner = self.inner.lock();
        if inner.do_shutdown {
            if !self.any_active_handles_inlock(&inner) {
                if let Some(event) = &inner.on_shutdown {
                    event.signal();
                }
            }
            return;
        }
        match inner.state {
            ReplicatorState::Rollback => self.next_actions_rollback_inlock(&mut inner),
            ReplicatorState::InitialSync => self.next_actions_initial_sync_inlock(&mut inner),
            ReplicatorState::Steady => self.next_actions_steady_inlock(&mut inner),
            ReplicatorState::Uninitialized => return,
        }
        self.change_state_if_needed_inlock(&mut inner);
    }

    fn next_actions_initial_sync_inlock(&self, inner: &mut Inner) {
        let (cloner_result, stop_ts, failed) = match inner.initial_sync.as_ref() {
            None => {
                tracing::warn!("no initial sync state, resetting state to Uninitialized");
                inner.state = ReplicatorState::Uninitialized;
                return;
            }
            Some(iss) => {
                if iss.dbs_cloner.is_active() {
                    return;
                }
                (iss.dbs_cloner.result(), iss.stop_ts, iss.failed())
            }
        };
        if failed {
            // A latched failure only awaits the completion event.
            return;
        }
        match cloner_result {
            None => return, // cloner not started yet
            Some(Err(e)) => {
                if let Some(iss) = inner.initial_sync.as_mut() {
                    iss.fail(e);
                }
                return;
            }
            Some(Ok(())) => {}
        }
        match (stop_ts, inner.last_applied) {
            (Some(stop), Some(applied)) if applied >= stop => {
                tracing::info!(
                    "applier done, initial sync done, end timestamp: {}, last applied: {}",
                    stop,
                    applied
                );
                inner.state = ReplicatorState::Uninitialized;
                if let Some(iss) = inner.initial_sync.as_mut() {
                    iss.succeed();
                }
            }
            // Run the steady handler so the applier drains the buffered
            // oplog up to the stop timestamp.
            _ => self.next_actions_steady_inlock(inner),
        }
    }

    fn next_actions_steady_inlock(&self, inner: &mut Inner) {
        if inner.sync_source.is_none() {
            inner.sync_source = self.choose_sync_source();
            if inner.sync_source.is_none() {
                // No sync source; look again after the retry wait.
                if let Some(core) = self.me.upgrade() {
                    let wait = self.opts.sync_source_retry_wait;
                    tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        core.do_next_actions();
                    });
                }
            }
        }
        if let Some(source) = inner.sync_source.clone() {
            let fetcher_active = inner.fetcher.as_ref().map_or(false, |f| f.is_active());
            if !fetcher_active && !inner.fetcher_paused {
                let start = inner.last_fetched.unwrap_or_else(|| self.start_optime());
                if let Err(e) = self.schedule_oplog_fetcher_inlock(inner, start, source.clone()) {
                    tracing::warn!("failed to schedule oplog fetcher: {}", e);
                }
            }
            if !inner.reporter_paused {
                let rebuild = match &inner.reporter {
                    None => true,
                    Some(reporter) => {
                        if reporter.status().is_ok() {
                            false
                        } else if reporter.is_active() {
                            // Drain the failed reporter before replacing it
                            // so its in-flight report stays visible to
                            // shutdown's handle accounting.
                            reporter.cancel();
                            if let Some(core) = self.me.upgrade() {
                                let old = reporter.clone();
                                tokio::spawn(async move {
                                    old.wait().await;
                                    core.do_next_actions();
                                });
                            }
                            false
                        } else {
                            true
                        }
                    }
                };
                if rebuild {
                    if let Some(coord) = &self.coord {
                        inner.reporter = Some(Reporter::new(
                            Arc::clone(&self.remote),
                            Arc::clone(coord),
                            source,
                        ));
                    }
                }
            }
        }
        if !inner.applier_active && !self.buffer.is_empty() {
            if let Err(e) = self.schedule_apply_batch_inlock(inner) {
                tracing::warn!("failed to schedule applier batch: {}", e);
            }
        }
    }

    fn next_actions_rollback_inlock(&self, _inner: &mut Inner) {
        // Rollback recovery is delegated to the integration layer; this
        // state only parks the replicator until it intervenes.
    }

    fn change_state_if_needed_inlock(&self, _inner: &mut Inner) {
        // Cross-state transitions such as steady to rollback hook in here.
        // The trigger condition is decided by the integration layer.
    }

    /// One initial sync attempt: pick a source, snapshot the oplog head,
    /// start buffering, clone every database, and wait for the attempt to
    /// settle.
    async fn run_initial_sync_attempt(&self) -> Result<()> {
        let finish_event = Event::new();
        let source = {
            let mut inner = self.inner.lock();
            if inner.do_shutdown {
                return Err(Error::CallbackCanceled);
            }
            // A wake-up between attempts sees no initial sync state and
            // resets to Uninitialized; this attempt owns the state again.
            inner.state = ReplicatorState::InitialSync;
            if self.fail_sync_source.load(Ordering::SeqCst) {
                return Err(Error::InvalidSyncSource("no sync source available".into()));
            }
            self.ensure_good_sync_source_inlock(&mut inner)?;
            inner
                .sync_source
                .clone()
                .ok_or_else(|| Error::InvalidSyncSource("no valid sync source".into()))?
        };

        let begin_ts =
            latest_oplog_timestamp(&self.remote, &source, &self.opts.remote_oplog_ns).await?;

        let cloner = {
            let mut inner = self.inner.lock();
            if inner.do_shutdown {
                return Err(Error::CallbackCanceled);
            }
            let core = self
                .me
                .upgrade()
                .ok_or_else(|| Error::Executor("replicator dropped".into()))?;
            let finish: ClonerFinishFn = Arc::new(move |status| {
                let core = Arc::clone(&core);
                Box::pin(async move {
                    core.on_data_cloner_finish(status);
                })
            });
            let cloner = DatabasesCloner::new(
                Arc::clone(&self.remote),
                source.clone(),
                Arc::clone(&self.cloner_factory),
                finish,
            );
            inner.initial_sync = Some(InitialSyncState::new(
                cloner.clone(),
                begin_ts,
                finish_event.clone(),
            ));
            // Buffering starts now and runs concurrently with cloning; the
            // applier stays paused until the stop timestamp is known.
            self.schedule_oplog_fetcher_inlock(&mut inner, begin_ts, source.clone())?;
            cloner
        };

        cloner.start()?;
        finish_event.wait().await;

        let inner = self.inner.lock();
        match inner.initial_sync.as_ref().and_then(|iss| iss.status().cloned()) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(e),
            None => Err(Error::InitialSyncFailure(
                "initial sync finished without a status".into(),
            )),
        }
    }

    /// All database clones are done; on success, probe the remote oplog
    /// head for the stop timestamp before unpausing the applier.
    fn on_data_cloner_finish(&self, status: Result<()>) {
        tracing::info!("data clone finished, status: {:?}", status);
        match status {
            Err(e) => {
                let mut inner = self.inner.lock();
                if let Some(iss) = inner.initial_sync.as_mut() {
                    iss.fail(e);
                }
            }
            Ok(()) => {
                let source = self.inner.lock().sync_source.clone();
                match source {
                    None => {
                        let mut inner = self.inner.lock();
                        if let Some(iss) = inner.initial_sync.as_mut() {
                            iss.fail(Error::InvalidSyncSource(
                                "sync source lost during initial sync".into(),
                            ));
                        }
                    }
                    Some(src) => {
                        if let Some(core) = self.me.upgrade() {
                            tokio::spawn(async move {
                                let ts = latest_oplog_timestamp(
                                    &core.remote,
                                    &src,
                                    &core.opts.remote_oplog_ns,
                                )
                                .await;
                                core.on_applier_ready(ts);
                            });
                        }
                    }
                }
            }
        }
        self.do_next_actions();
    }

    /// The stop timestamp is known; store it and let the applier run
    fn on_applier_ready(&self, ts: Result<Timestamp>) {
        {
            let mut inner = self.inner.lock();
            if inner.do_shutdown {
                return;
            }
            match ts {
                Ok(stop) => {
                    let Some(iss) = inner.initial_sync.as_mut() else {
                        return;
                    };
                    if iss.failed() {
                        return;
                    }
                    iss.stop_ts = Some(stop);
                    if inner.last_applied.map_or(true, |applied| applied < stop) {
                        tracing::info!("waiting for applier to run until ts: {}", stop);
                    }
                    assert!(
                        inner.applier_paused,
                        "applier must stay paused until the stop timestamp is known"
                    );
                    inner.applier_paused = false;
                }
                Err(e) => {
                    if let Some(iss) = inner.initial_sync.as_mut() {
                        iss.fail(e);
                    }
                }
            }
        }
        self.do_next_actions();
    }

    /// Delivery point for every oplog fetcher batch
    async fn on_oplog_batch(&self, result: Result<Batch>) -> NextAction {
        match result {
            Ok(batch) => {
                let exhausted = batch.cursor_id == 0;
                let mut last_ts = None;
                for doc in &batch.documents {
                    if let Some(ts) = entry_timestamp(doc) {
                        last_ts = Some(ts);
                    }
                }
                {
                    let mut inner = self.inner.lock();
                    match last_ts {
                        Some(ts) => inner.last_fetched = Some(ts),
                        None => tracing::warn!(
                            "did not find a 'ts' timestamp field in any of the fetched documents"
                        ),
                    }
                }
                for doc in batch.documents {
                    self.buffer.push(doc).await;
                }
                self.do_next_actions();
                if exhausted {
                    self.tick_after_fetcher_terminates();
                }
                NextAction::GetMore
            }
            Err(e) if e.is_canceled() => {
                self.do_next_actions();
                NextAction::NoAction
            }
            Err(e) => {
                self.on_oplog_fetch_error(e);
                self.tick_after_fetcher_terminates();
                NextAction::NoAction
            }
        }
    }

    /// A terminal fetcher flips inactive only after its last callback
    /// returns, so a decision pass made during that callback still sees it
    /// active and skips the reopen. Schedule one more pass for when the
    /// fetcher has actually terminated.
    fn tick_after_fetcher_terminates(&self) {
        let fetcher = self.inner.lock().fetcher.clone();
        let Some(fetcher) = fetcher else {
            return;
        };
        let Some(core) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            fetcher.wait().await;
            core.do_next_actions();
        });
    }

    fn on_oplog_fetch_error(&self, error: Error) {
        let source = self.inner.lock().sync_source.clone();
        if let Some(src) = &source {
            match &error {
                Error::OplogStartMissing(_) => {
                    let did_rollback = (self.opts.rollback_probe)(src);
                    if did_rollback {
                        tracing::info!(
                            "rollback against {} resolved the missing oplog start",
                            src
                        );
                    } else if let Some(coord) = &self.coord {
                        if !coord.set_follower_mode(FollowerMode::Recovering) {
                            tracing::error!(
                                "failed to transition to recovering after missing oplog start position from sync source {}",
                                src
                            );
                        }
                        coord.blacklist_sync_source(
                            src,
                            Instant::now() + self.opts.blacklist_penalty_oplog_start_missing,
                        );
                    }
                }
                _ => {
                    tracing::warn!("oplog fetch from {} failed: {}", src, error);
                    if let Some(coord) = &self.coord {
                        coord.blacklist_sync_source(
                            src,
                            Instant::now() + self.opts.blacklist_penalty_network_error,
                        );
                    }
                }
            }
        }
        {
            let mut inner = self.inner.lock();
            inner.sync_source = None;
            if inner.state == ReplicatorState::InitialSync {
                if let Some(iss) = inner.initial_sync.as_mut() {
                    iss.fail(error);
                }
            }
        }
        self.do_next_actions();
    }

    /// Completion of one applied batch
    fn on_apply_batch_finish(&self, result: Result<Timestamp>, ops: Vec<Document>) {
        let applied_ts = {
            let mut inner = self.inner.lock();
            match result {
                Err(e) if e.is_canceled() => {
                    inner.applier_active = false;
                    inner.applier = None;
                    drop(inner);
                    self.do_next_actions();
                    return;
                }
                Err(e) => {
                    self.handle_failed_apply_inlock(&mut inner, e, ops);
                    return;
                }
                Ok(ts) => {
                    if let Some(iss) = inner.initial_sync.as_mut() {
                        iss.stats.applied_ops += ops.len() as u64;
                    }
                    inner.applier_active = false;
                    inner.applier = None;
                    inner.last_applied = Some(ts);
                    ts
                }
            }
        };
        if let Some(coord) = &self.coord {
            coord.set_my_last_optime(applied_ts);
        }
        let reporter = self.inner.lock().reporter.clone();
        if let Some(reporter) = reporter {
            reporter.trigger();
        }
        self.do_next_actions();
    }

    fn handle_failed_apply_inlock(&self, inner: &mut Inner, error: Error, ops: Vec<Document>) {
        match inner.state {
            ReplicatorState::InitialSync => {
                self.schedule_apply_after_fetch_inlock(inner, ops, error)
            }
            _ => {
                // An apply failure outside initial sync means local data
                // has diverged in a way the replicator cannot repair.
                panic!("batch apply failed outside initial sync: {}", error);
            }
        }
    }

    /// Fetch the document a failed apply was missing, insert it, and retry
    /// the same batch. The applier stays marked active throughout so no
    /// competing batch can start.
    fn schedule_apply_after_fetch_inlock(&self, inner: &mut Inner, ops: Vec<Document>, cause: Error) {
        let Some(iss) = inner.initial_sync.as_mut() else {
            inner.applier_active = false;
            inner.applier = None;
            return;
        };
        iss.stats.fetched_missing_docs += 1;
        let first = ops.first();
        let id = first.and_then(entry_missing_id);
        let ns = first.and_then(entry_namespace);
        let (Some(id), Some(ns)) = (id, ns) else {
            iss.fail(Error::InitialSyncFailure(format!(
                "failed apply does not identify a missing document: {}",
                cause
            )));
            inner.applier_active = false;
            inner.applier = None;
            return;
        };
        let Some(source) = inner.sync_source.clone() else {
            iss.fail(Error::InvalidSyncSource(
                "sync source lost while fetching missing document".into(),
            ));
            inner.applier_active = false;
            inner.applier = None;
            return;
        };
        let finish_event = iss.finish_event.clone();
        tracing::info!("fetching missing document {} from {} for {}", id, source, ns);
        if let Some(core) = self.me.upgrade() {
            tokio::spawn(async move {
                core.fetch_missing_and_retry(source, ns, id, ops, finish_event)
                    .await;
            });
        }
    }

    async fn fetch_missing_and_retry(
        &self,
        source: HostAndPort,
        ns: Namespace,
        id: Document,
        ops: Vec<Document>,
        finish_event: Event,
    ) {
        let options = FindOptions {
            filter: Some(json!({ "_id": id })),
            limit: Some(1),
            ..Default::default()
        };
        // The attempt's completion event doubles as the abort signal: once
        // the sync is settled there is nothing left to repair.
        let found = match finish_event.race(self.remote.find(&source, &ns, options)).await {
            Err(e) => {
                self.fail_initial_sync_apply(e);
                return;
            }
            Ok(batch) => match batch.documents.into_iter().next() {
                None => {
                    self.fail_initial_sync_apply(Error::InitialSyncFailure(
                        "missing doc not found".into(),
                    ));
                    return;
                }
                Some(doc) => doc,
            },
        };
        if let Err(e) = self.storage.insert_missing_doc(&ns, found).await {
            self.fail_initial_sync_apply(e);
            return;
        }
        // Re-apply the same batch now the hole is filled.
        let retry = {
            let mut inner = self.inner.lock();
            let attempt_alive = inner
                .initial_sync
                .as_ref()
                .map_or(false, |iss| !iss.failed());
            if attempt_alive {
                self.spawn_applier_inlock(&mut inner, ops)
            } else {
                inner.applier_active = false;
                inner.applier = None;
                Ok(())
            }
        };
        if let Err(e) = retry {
            self.fail_initial_sync_apply(e);
        }
    }

    fn fail_initial_sync_apply(&self, error: Error) {
        {
            let mut inner = self.inner.lock();
            inner.applier_active = false;
            inner.applier = None;
            if let Some(iss) = inner.initial_sync.as_mut() {
                if !error.is_canceled() {
                    iss.fail(error);
                }
            }
        }
        self.do_next_actions();
    }

    fn schedule_oplog_fetcher_inlock(
        &self,
        inner: &mut Inner,
        start: Timestamp,
        source: HostAndPort,
    ) -> Result<()> {
        let core = self
            .me
            .upgrade()
            .ok_or_else(|| Error::Executor("replicator dropped".into()))?;
        let callback: BatchCallback = Arc::new(move |result| {
            let core = Arc::clone(&core);
            Box::pin(async move { core.on_oplog_batch(result).await })
        });
        let fetcher = OplogFetcher::new(
            Arc::clone(&self.remote),
            start,
            source,
            self.opts.remote_oplog_ns.clone(),
            callback,
        );
        fetcher.schedule()?;
        inner.fetcher = Some(fetcher);
        Ok(())
    }

    fn schedule_apply_batch_inlock(&self, inner: &mut Inner) -> Result<()> {
        if inner.applier_paused || inner.applier_active {
            return Ok(());
        }
        let ops = self.next_applier_batch();
        if ops.is_empty() {
            return Ok(());
        }
        assert!(
            inner.applier.as_ref().map_or(true, |a| !a.is_active()),
            "two appliers cannot run at once"
        );
        inner.applier_active = true;
        self.spawn_applier_inlock(inner, ops)
    }

    /// Drain the buffer into one batch
    fn next_applier_batch(&self) -> Vec<Document> {
        let mut ops = Vec::new();
        while let Some(doc) = self.buffer.try_pop() {
            ops.push(doc);
        }
        ops
    }

    fn spawn_applier_inlock(&self, inner: &mut Inner, ops: Vec<Document>) -> Result<()> {
        let core = self
            .me
            .upgrade()
            .ok_or_else(|| Error::Executor("replicator dropped".into()))?;
        let completion: ApplierCompletionFn = Arc::new(move |result, ops| {
            let core = Arc::clone(&core);
            Box::pin(async move {
                core.on_apply_batch_finish(result, ops);
            })
        });
        let applier = Applier::new(ops, Arc::clone(&self.opts.applier_fn), completion);
        applier.start()?;
        inner.applier = Some(applier);
        Ok(())
    }

    fn choose_sync_source(&self) -> Option<HostAndPort> {
        match &self.coord {
            Some(coord) => coord.choose_new_sync_source(),
            None => self.opts.sync_source.clone(),
        }
    }

    fn ensure_good_sync_source_inlock(&self, inner: &mut Inner) -> Result<()> {
        if inner.sync_source.is_none() {
            inner.sync_source = self.choose_sync_source();
        }
        match &inner.sync_source {
            Some(_) => Ok(()),
            None => Err(Error::InvalidSyncSource("no valid sync source".into())),
        }
    }

    fn start_optime(&self) -> Timestamp {
        match &self.coord {
            Some(coord) => coord.get_my_last_optime(),
            None => self.opts.start_optime,
        }
    }

    fn any_active_handles_inlock(&self, inner: &Inner) -> bool {
        inner.applier_active
            || inner.fetcher.as_ref().map_or(false, |f| f.is_active())
            || inner
                .initial_sync
                .as_ref()
                .map_or(false, |iss| iss.dbs_cloner.is_active())
            || inner.reporter.as_ref().map_or(false, |r| r.is_active())
    }

    fn cancel_all_handles_inlock(&self, inner: &mut Inner) {
        if let Some(fetcher) = &inner.fetcher {
            fetcher.cancel();
        }
        if let Some(applier) = &inner.applier {
            applier.cancel();
        }
        if let Some(reporter) = &inner.reporter {
            reporter.cancel();
        }
        if let Some(iss) = inner.initial_sync.as_mut() {
            iss.dbs_cloner.cancel();
            // Wake the initial sync waiter; the attempt cannot finish once
            // its subtasks are canceled.
            iss.fail(Error::CallbackCanceled);
        }
    }
}

/// Query the newest entry of the remote oplog
async fn latest_oplog_timestamp(
    remote: &Arc<dyn RemoteClient>,
    source: &HostAndPort,
    oplog_ns: &Namespace,
) -> Result<Timestamp> {
    let options = FindOptions {
        sort: Some(json!({ "$natural": -1 })),
        limit: Some(1),
        ..Default::default()
    };
    let batch = remote.find(source, oplog_ns, options).await?;
    batch
        .documents
        .first()
        .and_then(entry_timestamp)
        .ok_or_else(|| {
            Error::FailedToParse("could not find an oplog entry with 'ts' field".into())
        })
}
