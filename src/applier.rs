//! Batch Applier
//!
//! Applies one batch of oplog operations through an external apply
//! function and reports the outcome to a completion callback. The
//! replicator guarantees at most one applier runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::oplog::Timestamp;
use crate::remote::Document;

/// External apply function
///
/// Applies a batch of oplog operations and returns the timestamp of the
/// last successfully applied one. Pure with respect to the replicator.
pub type ApplyFn = Arc<dyn Fn(&[Document]) -> Result<Timestamp> + Send + Sync>;

/// Completion callback: receives the apply outcome and the batch it covered
pub type ApplierCompletionFn =
    Arc<dyn Fn(Result<Timestamp>, Vec<Document>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Applies one batch of operations
#[derive(Clone)]
pub struct Applier {
    inner: Arc<ApplierInner>,
}

struct ApplierInner {
    ops: Mutex<Option<Vec<Document>>>,
    apply_fn: ApplyFn,
    on_complete: ApplierCompletionFn,
    scheduled: AtomicBool,
    active: AtomicBool,
    cancel: Event,
    done: Event,
}

impl Applier {
    /// Create an applier for one batch
    pub fn new(ops: Vec<Document>, apply_fn: ApplyFn, on_complete: ApplierCompletionFn) -> Self {
        Self {
            inner: Arc::new(ApplierInner {
                ops: Mutex::new(Some(ops)),
                apply_fn,
                on_complete,
                scheduled: AtomicBool::new(false),
                active: AtomicBool::new(false),
                cancel: Event::new(),
                done: Event::new(),
            }),
        }
    }

    /// Schedule the apply. Fails if already started.
    pub fn start(&self) -> Result<()> {
        if self.inner.scheduled.swap(true, Ordering::SeqCst) {
            return Err(Error::IllegalOperation("applier already started".into()));
        }
        self.inner.active.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run().await;
        });
        Ok(())
    }

    /// Skip the apply if it has not begun; the completion callback still
    /// fires, with a canceled status
    pub fn cancel(&self) {
        self.inner.cancel.signal();
    }

    /// Wait until the completion callback has returned
    pub async fn wait(&self) {
        if self.inner.scheduled.load(Ordering::SeqCst) {
            self.inner.done.wait().await;
        }
    }

    /// True between `start` and the completion callback returning
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }
}

impl ApplierInner {
    async fn run(&self) {
        let ops = self.ops.lock().take().unwrap_or_default();
        let result = if self.cancel.is_signaled() {
            Err(Error::CallbackCanceled)
        } else {
            (self.apply_fn)(&ops)
        };
        (self.on_complete)(result, ops).await;
        self.active.store(false, Ordering::SeqCst);
        self.done.signal();
    }
}
