//! Shared Test Doubles
//!
//! Scripted collaborators used across the test suite: a remote client that
//! answers from queued responses, a recording coordinator, and database
//! cloners with scripted outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use crate::cloner::{ClonerFactory, DatabaseCloner};
use crate::coordinator::{FollowerMode, ReplicationCoordinator};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::oplog::Timestamp;
use crate::remote::{CursorBatch, Document, FindOptions, HostAndPort, Namespace, RemoteClient};

/// A representative oplog insert entry
pub fn op_doc(ts: u64) -> Document {
    json!({ "ts": ts, "ns": "test.coll", "op": "i", "o": { "_id": ts } })
}

/// A cursor batch with the given live cursor id
pub fn batch(cursor_id: u64, documents: Vec<Document>) -> CursorBatch {
    CursorBatch {
        cursor_id,
        documents,
    }
}

/// Install a test subscriber so tracing output lands in the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
struct RemoteScript {
    find_responses: VecDeque<Result<CursorBatch>>,
    head_responses: VecDeque<Result<CursorBatch>>,
    missing_responses: VecDeque<Result<CursorBatch>>,
    get_more_responses: VecDeque<Result<CursorBatch>>,
    command_responses: HashMap<String, VecDeque<Result<Document>>>,
    finds: Vec<(HostAndPort, Namespace, FindOptions)>,
    get_mores: Vec<(HostAndPort, Namespace, u64)>,
    commands: Vec<(HostAndPort, String, Document)>,
}

/// Remote client answering from scripted response queues
///
/// Find commands are routed by shape: a sort means an oplog-head probe, an
/// `_id` filter means a missing-document lookup, anything else is a plain
/// scan. A call with no scripted response waits until one is pushed, which
/// also makes it cancelable by whoever raced it with an event.
pub struct ScriptedRemote {
    state: Mutex<RemoteScript>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RemoteScript::default()),
        })
    }

    pub fn push_find(&self, response: Result<CursorBatch>) {
        self.state.lock().find_responses.push_back(response);
    }

    pub fn push_head(&self, response: Result<CursorBatch>) {
        self.state.lock().head_responses.push_back(response);
    }

    pub fn push_missing(&self, response: Result<CursorBatch>) {
        self.state.lock().missing_responses.push_back(response);
    }

    pub fn push_get_more(&self, response: Result<CursorBatch>) {
        self.state.lock().get_more_responses.push_back(response);
    }

    pub fn push_command(&self, name: &str, response: Result<Document>) {
        self.state
            .lock()
            .command_responses
            .entry(name.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn finds(&self) -> Vec<(HostAndPort, Namespace, FindOptions)> {
        self.state.lock().finds.clone()
    }

    pub fn get_mores(&self) -> Vec<(HostAndPort, Namespace, u64)> {
        self.state.lock().get_mores.clone()
    }

    pub fn commands(&self) -> Vec<(HostAndPort, String, Document)> {
        self.state.lock().commands.clone()
    }
}

fn command_name(command: &Document) -> String {
    for name in ["listDatabases", "listCollections", "updatePosition"] {
        if command.get(name).is_some() {
            return name.to_string();
        }
    }
    "unknown".to_string()
}

#[async_trait::async_trait]
impl RemoteClient for ScriptedRemote {
    async fn run_command(
        &self,
        target: &HostAndPort,
        db: &str,
        command: Document,
    ) -> Result<Document> {
        let name = command_name(&command);
        self.state
            .lock()
            .commands
            .push((target.clone(), db.to_string(), command));
        loop {
            {
                let mut state = self.state.lock();
                if let Some(queue) = state.command_responses.get_mut(&name) {
                    if let Some(response) = queue.pop_front() {
                        return response;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn find(
        &self,
        target: &HostAndPort,
        ns: &Namespace,
        options: FindOptions,
    ) -> Result<CursorBatch> {
        let is_head = options.sort.is_some();
        let is_missing = options
            .filter
            .as_ref()
            .map_or(false, |f| f.get("_id").is_some());
        self.state
            .lock()
            .finds
            .push((target.clone(), ns.clone(), options));
        loop {
            {
                let mut state = self.state.lock();
                let queue = if is_head {
                    &mut state.head_responses
                } else if is_missing {
                    &mut state.missing_responses
                } else {
                    &mut state.find_responses
                };
                if let Some(response) = queue.pop_front() {
                    return response;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn get_more(
        &self,
        target: &HostAndPort,
        ns: &Namespace,
        cursor_id: u64,
    ) -> Result<CursorBatch> {
        self.state
            .lock()
            .get_mores
            .push((target.clone(), ns.clone(), cursor_id));
        loop {
            {
                let mut state = self.state.lock();
                if let Some(response) = state.get_more_responses.pop_front() {
                    return response;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

/// Coordinator that records every call and answers from scripted sources
pub struct RecordingCoordinator {
    sources: Mutex<VecDeque<Option<HostAndPort>>>,
    default_source: Mutex<Option<HostAndPort>>,
    choose_calls: AtomicU64,
    blacklists: Mutex<Vec<(HostAndPort, Instant)>>,
    follower_modes: Mutex<Vec<FollowerMode>>,
    last_optime: Mutex<Timestamp>,
}

impl RecordingCoordinator {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(VecDeque::new()),
            default_source: Mutex::new(None),
            choose_calls: AtomicU64::new(0),
            blacklists: Mutex::new(Vec::new()),
            follower_modes: Mutex::new(Vec::new()),
            last_optime: Mutex::new(Timestamp::default()),
        }
    }

    /// Queue one answer for `choose_new_sync_source`
    pub fn queue_source(&self, source: Option<HostAndPort>) {
        self.sources.lock().push_back(source);
    }

    /// Answer for `choose_new_sync_source` once the queue is drained
    pub fn set_default_source(&self, source: Option<HostAndPort>) {
        *self.default_source.lock() = source;
    }

    pub fn choose_calls(&self) -> u64 {
        self.choose_calls.load(Ordering::SeqCst)
    }

    pub fn blacklists(&self) -> Vec<(HostAndPort, Instant)> {
        self.blacklists.lock().clone()
    }

    pub fn follower_modes(&self) -> Vec<FollowerMode> {
        self.follower_modes.lock().clone()
    }
}

impl ReplicationCoordinator for RecordingCoordinator {
    fn choose_new_sync_source(&self) -> Option<HostAndPort> {
        self.choose_calls.fetch_add(1, Ordering::SeqCst);
        match self.sources.lock().pop_front() {
            Some(source) => source,
            None => self.default_source.lock().clone(),
        }
    }

    fn blacklist_sync_source(&self, host: &HostAndPort, until: Instant) {
        self.blacklists.lock().push((host.clone(), until));
    }

    fn get_my_last_optime(&self) -> Timestamp {
        *self.last_optime.lock()
    }

    fn set_my_last_optime(&self, optime: Timestamp) {
        *self.last_optime.lock() = optime;
    }

    fn set_follower_mode(&self, mode: FollowerMode) -> bool {
        self.follower_modes.lock().push(mode);
        true
    }
}

/// Scripted outcome for one database cloner
#[derive(Clone)]
pub enum ClonerBehavior {
    /// Finish immediately with success
    Succeed,
    /// Finish immediately with the given error
    Fail(Error),
    /// Finish with the given error after a delay
    FailAfter(Error, Duration),
    /// Run until canceled
    BlockUntilCancel,
}

/// Database cloner following a scripted behavior
pub struct ScriptedCloner {
    db: String,
    behavior: ClonerBehavior,
    cancel: Event,
}

impl ScriptedCloner {
    pub fn new(db: impl Into<String>, behavior: ClonerBehavior) -> Self {
        Self {
            db: db.into(),
            behavior,
            cancel: Event::new(),
        }
    }
}

#[async_trait::async_trait]
impl DatabaseCloner for ScriptedCloner {
    fn db_name(&self) -> &str {
        &self.db
    }

    async fn run(&self) -> Result<()> {
        match &self.behavior {
            ClonerBehavior::Succeed => Ok(()),
            ClonerBehavior::Fail(e) => Err(e.clone()),
            ClonerBehavior::FailAfter(e, delay) => {
                tokio::time::sleep(*delay).await;
                Err(e.clone())
            }
            ClonerBehavior::BlockUntilCancel => {
                self.cancel.wait().await;
                Err(Error::CallbackCanceled)
            }
        }
    }

    fn cancel(&self) {
        self.cancel.signal();
    }
}

/// Factory producing scripted cloners, with per-database overrides
pub fn scripted_cloner_factory(
    overrides: HashMap<String, ClonerBehavior>,
    default: ClonerBehavior,
) -> ClonerFactory {
    Arc::new(move |_source, db| {
        let behavior = overrides.get(db).cloned().unwrap_or_else(|| default.clone());
        Arc::new(ScriptedCloner::new(db, behavior))
    })
}
