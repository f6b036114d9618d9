//! Database Cloning Orchestration
//!
//! Lists the sync source's databases and fans one database cloner out per
//! database, collecting their completion into a single finish callback.

mod database;

pub use database::CollectionScanCloner;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::remote::{Document, HostAndPort, RemoteClient};

/// A single-database cloner
///
/// Implementations copy one remote database into local storage.
#[async_trait::async_trait]
pub trait DatabaseCloner: Send + Sync {
    /// Name of the database being cloned
    fn db_name(&self) -> &str;

    /// Copy the database. Cancellation is observed between units of work
    /// and surfaces as `CallbackCanceled`.
    async fn run(&self) -> Result<()>;

    /// Request an early stop
    fn cancel(&self);
}

/// Builds a database cloner for one remote database
pub type ClonerFactory =
    Arc<dyn Fn(&HostAndPort, &str) -> Arc<dyn DatabaseCloner> + Send + Sync>;

/// Invoked exactly once when all database clones have terminated
pub type ClonerFinishFn = Arc<dyn Fn(Result<()>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClonePhase {
    NotStarted,
    Listing,
    Cloning,
    Done,
}

struct ClonerSetState {
    phase: ClonePhase,
    /// First failure wins; later failures are not recorded
    error: Option<Error>,
    cloners: Vec<Arc<dyn DatabaseCloner>>,
    active_cloners: usize,
    finished: bool,
}

struct ClonerSetInner {
    remote: Arc<dyn RemoteClient>,
    source: HostAndPort,
    factory: ClonerFactory,
    finish_fn: ClonerFinishFn,
    state: parking_lot::Mutex<ClonerSetState>,
    cancel: Event,
    done: Event,
}

/// Fans one cloner out per remote database and collects completion
#[derive(Clone)]
pub struct DatabasesCloner {
    inner: Arc<ClonerSetInner>,
}

impl DatabasesCloner {
    /// Create a cloner set against `source`
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        source: HostAndPort,
        factory: ClonerFactory,
        finish_fn: ClonerFinishFn,
    ) -> Self {
        Self {
            inner: Arc::new(ClonerSetInner {
                remote,
                source,
                factory,
                finish_fn,
                state: parking_lot::Mutex::new(ClonerSetState {
                    phase: ClonePhase::NotStarted,
                    error: None,
                    cloners: Vec::new(),
                    active_cloners: 0,
                    finished: false,
                }),
                cancel: Event::new(),
                done: Event::new(),
            }),
        }
    }

    /// Kick off listing and cloning asynchronously
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != ClonePhase::NotStarted {
                return Err(Error::IllegalOperation(
                    "databases cloner already started".into(),
                ));
            }
            state.phase = ClonePhase::Listing;
        }
        tracing::info!("starting clone of all databases from {}", self.inner.source);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run_list().await;
        });
        Ok(())
    }

    /// Stop cloning. The finish callback still fires, with a canceled
    /// status; in-flight children terminate on their own schedule. A
    /// cloner canceled before `start` finishes canceled as soon as it is
    /// started.
    pub fn cancel(&self) {
        let children = {
            let mut state = self.inner.state.lock();
            if state.phase == ClonePhase::Done {
                return;
            }
            if state.error.is_none() {
                state.error = Some(Error::CallbackCanceled);
            }
            state.cloners.clone()
        };
        self.inner.cancel.signal();
        for cloner in children {
            cloner.cancel();
        }
    }

    /// Wait until all children have terminated and the finish callback has
    /// returned
    pub async fn wait(&self) {
        if self.inner.state.lock().phase == ClonePhase::NotStarted {
            return;
        }
        self.inner.done.wait().await;
    }

    /// True while listing or cloning is in progress
    pub fn is_active(&self) -> bool {
        matches!(
            self.inner.state.lock().phase,
            ClonePhase::Listing | ClonePhase::Cloning
        )
    }

    /// Final outcome, `None` until all children have terminated
    pub fn result(&self) -> Option<Result<()>> {
        let state = self.inner.state.lock();
        if state.phase != ClonePhase::Done {
            return None;
        }
        Some(match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        })
    }
}

impl fmt::Display for DatabasesCloner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        write!(
            f,
            "DatabasesCloner {{ source: {}, phase: {:?}, cloners active: {}, db count: {}, error: {:?} }}",
            self.inner.source,
            state.phase,
            state.active_cloners,
            state.cloners.len(),
            state.error
        )
    }
}

impl ClonerSetInner {
    async fn run_list(self: Arc<Self>) {
        let response = self
            .cancel
            .race(
                self.remote
                    .run_command(&self.source, "admin", json!({ "listDatabases": 1 })),
            )
            .await;
        let names = response.and_then(parse_database_names);

        let to_spawn: Vec<Arc<dyn DatabaseCloner>> = {
            let mut state = self.state.lock();
            if state.error.is_some() {
                self.finish_inlock(&mut state);
                return;
            }
            match names {
                Err(e) => {
                    state.error = Some(e);
                    self.finish_inlock(&mut state);
                    return;
                }
                Ok(names) if names.is_empty() => {
                    self.finish_inlock(&mut state);
                    return;
                }
                Ok(names) => {
                    state.phase = ClonePhase::Cloning;
                    for name in &names {
                        let cloner = (self.factory)(&self.source, name);
                        state.cloners.push(Arc::clone(&cloner));
                        state.active_cloners += 1;
                    }
                    state.cloners.clone()
                }
            }
        };

        for cloner in to_spawn {
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                let status = cloner.run().await;
                inner.on_child_finish(cloner.db_name(), status);
            });
        }
    }

    fn on_child_finish(&self, name: &str, status: Result<()>) {
        let mut state = self.state.lock();
        match &status {
            Ok(()) => tracing::info!("database clone finished: {}", name),
            Err(e) => {
                tracing::warn!("database clone of {} failed: {}", name, e);
                if state.error.is_none() {
                    state.error = Some(e.clone());
                }
            }
        }
        state.active_cloners -= 1;
        if state.active_cloners == 0 {
            self.finish_inlock(&mut state);
        }
    }

    /// Deliver the latched status exactly once. The callback itself runs
    /// off the lock.
    fn finish_inlock(&self, state: &mut ClonerSetState) {
        if state.finished {
            return;
        }
        state.finished = true;
        state.phase = ClonePhase::Done;
        let result = match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        };
        tracing::info!("all database clones finished, status: {:?}", result);
        let finish = Arc::clone(&self.finish_fn);
        let done = self.done.clone();
        tokio::spawn(async move {
            finish(result).await;
            done.signal();
        });
    }
}

fn parse_database_names(response: Document) -> Result<Vec<String>> {
    let ok = response
        .get("ok")
        .and_then(Document::as_u64)
        .unwrap_or(0)
        == 1;
    if !ok {
        return Err(Error::InitialSyncFailure(
            "failed to clone databases due to failed server response".into(),
        ));
    }
    response
        .get("databases")
        .and_then(Document::as_array)
        .ok_or_else(|| Error::FailedToParse("listDatabases reply has no databases array".into()))?
        .iter()
        .map(|db| {
            db.get("name")
                .and_then(Document::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::FailedToParse("database entry has no name".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{scripted_cloner_factory, ClonerBehavior, ScriptedRemote};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    fn source() -> HostAndPort {
        HostAndPort::new("primary", 27017)
    }

    fn list_reply(names: &[&str]) -> Document {
        let dbs: Vec<Document> = names.iter().map(|n| json!({ "name": n })).collect();
        json!({ "ok": 1, "databases": dbs })
    }

    fn finish_log() -> (Arc<Mutex<Vec<Result<()>>>>, ClonerFinishFn) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let finish = {
            let log = Arc::clone(&log);
            Arc::new(move |result: Result<()>| {
                let log = Arc::clone(&log);
                Box::pin(async move {
                    log.lock().push(result);
                }) as BoxFuture<'static, ()>
            })
        };
        (log, finish)
    }

    #[tokio::test]
    async fn test_fans_out_one_cloner_per_database() {
        let remote = ScriptedRemote::new();
        remote.push_command("listDatabases", Ok(list_reply(&["admin", "db1", "db2"])));
        let (log, finish) = finish_log();
        let factory = scripted_cloner_factory(HashMap::new(), ClonerBehavior::Succeed);

        let cloner = DatabasesCloner::new(remote, source(), factory, finish);
        cloner.start().unwrap();
        cloner.wait().await;

        assert_eq!(log.lock().as_slice(), &[Ok(())]);
        assert_eq!(cloner.result(), Some(Ok(())));
        assert!(!cloner.is_active());
    }

    #[tokio::test]
    async fn test_no_databases_finishes_ok() {
        let remote = ScriptedRemote::new();
        remote.push_command("listDatabases", Ok(list_reply(&[])));
        let (log, finish) = finish_log();
        let factory = scripted_cloner_factory(HashMap::new(), ClonerBehavior::Succeed);

        let cloner = DatabasesCloner::new(remote, source(), factory, finish);
        cloner.start().unwrap();
        cloner.wait().await;

        assert_eq!(log.lock().as_slice(), &[Ok(())]);
    }

    #[tokio::test]
    async fn test_list_databases_error_latches() {
        let remote = ScriptedRemote::new();
        remote.push_command("listDatabases", Err(Error::Network("down".into())));
        let (log, finish) = finish_log();
        let factory = scripted_cloner_factory(HashMap::new(), ClonerBehavior::Succeed);

        let cloner = DatabasesCloner::new(remote, source(), factory, finish);
        cloner.start().unwrap();
        cloner.wait().await;

        assert_eq!(log.lock().as_slice(), &[Err(Error::Network("down".into()))]);
    }

    #[tokio::test]
    async fn test_failed_server_response_is_initial_sync_failure() {
        let remote = ScriptedRemote::new();
        remote.push_command("listDatabases", Ok(json!({ "ok": 0 })));
        let (log, finish) = finish_log();
        let factory = scripted_cloner_factory(HashMap::new(), ClonerBehavior::Succeed);

        let cloner = DatabasesCloner::new(remote, source(), factory, finish);
        cloner.start().unwrap();
        cloner.wait().await;

        assert!(matches!(
            log.lock().as_slice(),
            [Err(Error::InitialSyncFailure(_))]
        ));
    }

    #[tokio::test]
    async fn test_first_failure_wins() {
        let remote = ScriptedRemote::new();
        remote.push_command("listDatabases", Ok(list_reply(&["db1", "db2"])));
        let (log, finish) = finish_log();
        // db1 fails fast, db2 fails later; the first error is kept.
        let mut behaviors = HashMap::new();
        behaviors.insert(
            "db1".to_string(),
            ClonerBehavior::Fail(Error::Storage("first".into())),
        );
        behaviors.insert(
            "db2".to_string(),
            ClonerBehavior::FailAfter(Error::Storage("second".into()), Duration::from_millis(50)),
        );
        let factory = scripted_cloner_factory(behaviors, ClonerBehavior::Succeed);

        let cloner = DatabasesCloner::new(remote, source(), factory, finish);
        cloner.start().unwrap();
        cloner.wait().await;

        assert_eq!(
            log.lock().as_slice(),
            &[Err(Error::Storage("first".into()))]
        );
    }

    #[tokio::test]
    async fn test_cancel_delivers_callback_canceled() {
        let remote = ScriptedRemote::new();
        remote.push_command("listDatabases", Ok(list_reply(&["db1"])));
        let (log, finish) = finish_log();
        let factory = scripted_cloner_factory(HashMap::new(), ClonerBehavior::BlockUntilCancel);

        let cloner = DatabasesCloner::new(remote, source(), factory, finish);
        cloner.start().unwrap();
        // Let the child get going before canceling it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cloner.is_active());
        cloner.cancel();
        cloner.wait().await;

        assert_eq!(log.lock().as_slice(), &[Err(Error::CallbackCanceled)]);
        assert_eq!(cloner.result(), Some(Err(Error::CallbackCanceled)));
    }

    #[tokio::test]
    async fn test_cancel_during_listing() {
        let remote = ScriptedRemote::new();
        // No listDatabases reply scripted: the command stays pending.
        let (log, finish) = finish_log();
        let factory = scripted_cloner_factory(HashMap::new(), ClonerBehavior::Succeed);

        let cloner = DatabasesCloner::new(remote, source(), factory, finish);
        cloner.start().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cloner.cancel();
        cloner.wait().await;

        assert_eq!(log.lock().as_slice(), &[Err(Error::CallbackCanceled)]);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let remote = ScriptedRemote::new();
        remote.push_command("listDatabases", Ok(list_reply(&[])));
        let (_log, finish) = finish_log();
        let factory = scripted_cloner_factory(HashMap::new(), ClonerBehavior::Succeed);

        let cloner = DatabasesCloner::new(remote, source(), factory, finish);
        cloner.start().unwrap();
        assert!(cloner.start().is_err());
        cloner.wait().await;
    }
}
