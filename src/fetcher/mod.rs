//! Remote Cursor Fetchers
//!
//! A fetcher drives a remote find plus get-more sequence as a series of
//! batches and delivers each batch to a callback. The callback decides
//! whether the fetcher keeps the cursor alive or stops.

mod oplog;

pub use oplog::OplogFetcher;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::remote::{Document, FindOptions, HostAndPort, Namespace, RemoteClient};

/// What the fetcher does after delivering a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Continue with a get-more on the live cursor
    GetMore,
    /// Stop fetching; the in-flight cursor is abandoned
    NoAction,
}

/// One delivered batch
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Collection the cursor runs over
    pub ns: Namespace,
    /// Live cursor id, zero when exhausted
    pub cursor_id: u64,
    /// Documents in this batch
    pub documents: Vec<Document>,
    /// True for the first response of the sequence
    pub first: bool,
}

/// Per-batch callback
///
/// Invoked with each batch or with the terminal error (including
/// cancellation). The returned action tells the fetcher whether to
/// continue; it is ignored once the cursor is exhausted or an error has
/// been delivered.
pub type BatchCallback =
    Arc<dyn Fn(Result<Batch>) -> BoxFuture<'static, NextAction> + Send + Sync>;

/// Drives a remote cursor as a sequence of batches
///
/// A fetcher runs at most once: `schedule` starts it, `cancel` aborts the
/// in-flight request, and `wait` blocks until the terminal callback has
/// been delivered.
#[derive(Clone)]
pub struct QueryFetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    remote: Arc<dyn RemoteClient>,
    source: HostAndPort,
    ns: Namespace,
    options: FindOptions,
    callback: BatchCallback,
    scheduled: AtomicBool,
    active: AtomicBool,
    responses: AtomicU64,
    cancel: Event,
    done: Event,
}

impl QueryFetcher {
    /// Create a fetcher over `ns` on `source`
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        source: HostAndPort,
        ns: Namespace,
        options: FindOptions,
        callback: BatchCallback,
    ) -> Self {
        Self {
            inner: Arc::new(FetcherInner {
                remote,
                source,
                ns,
                options,
                callback,
                scheduled: AtomicBool::new(false),
                active: AtomicBool::new(false),
                responses: AtomicU64::new(0),
                cancel: Event::new(),
                done: Event::new(),
            }),
        }
    }

    /// Begin fetching. Fails if this fetcher was already scheduled.
    pub fn schedule(&self) -> Result<()> {
        if self.inner.scheduled.swap(true, Ordering::SeqCst) {
            return Err(Error::IllegalOperation("fetcher already scheduled".into()));
        }
        self.inner.active.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run().await;
        });
        Ok(())
    }

    /// Abort the in-flight request. The terminal callback still fires,
    /// with a canceled status.
    pub fn cancel(&self) {
        self.inner.cancel.signal();
    }

    /// Wait until no callback remains in flight
    pub async fn wait(&self) {
        if self.inner.scheduled.load(Ordering::SeqCst) {
            self.inner.done.wait().await;
        }
    }

    /// True between `schedule` and the terminal callback
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Number of responses received so far
    pub fn responses(&self) -> u64 {
        self.inner.responses.load(Ordering::SeqCst)
    }
}

impl fmt::Display for QueryFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueryFetcher {{ ns: {}, source: {}, responses: {}, active: {} }}",
            self.inner.ns,
            self.inner.source,
            self.responses(),
            self.is_active()
        )
    }
}

impl FetcherInner {
    async fn run(&self) {
        let mut cursor_id: Option<u64> = None;
        loop {
            let response = match cursor_id {
                None => {
                    self.cancel
                        .race(self.remote.find(&self.source, &self.ns, self.options.clone()))
                        .await
                }
                Some(id) => {
                    self.cancel
                        .race(self.remote.get_more(&self.source, &self.ns, id))
                        .await
                }
            };

            match response {
                Ok(raw) => {
                    let first = self.responses.fetch_add(1, Ordering::SeqCst) == 0;
                    cursor_id = Some(raw.cursor_id);
                    let batch = Batch {
                        ns: self.ns.clone(),
                        cursor_id: raw.cursor_id,
                        documents: raw.documents,
                        first,
                    };
                    let exhausted = batch.cursor_id == 0;
                    let action = (self.callback)(Ok(batch)).await;
                    if exhausted || action == NextAction::NoAction {
                        break;
                    }
                }
                Err(e) => {
                    let _ = (self.callback)(Err(e)).await;
                    break;
                }
            }
        }
        self.active.store(false, Ordering::SeqCst);
        self.done.signal();
    }
}
