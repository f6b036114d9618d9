//! Oplog Tailing Fetcher
//!
//! Specializes the query fetcher for oplog cursors. The first batch must
//! begin exactly at the requested start timestamp; anything else means the
//! sync source has rolled its oplog past us and the distinguished
//! `OplogStartMissing` error is surfaced.

use std::sync::Arc;

use serde_json::json;

use crate::error::{Error, Result};
use crate::fetcher::{Batch, BatchCallback, NextAction, QueryFetcher};
use crate::oplog::{entry_timestamp, Timestamp};
use crate::remote::{FindOptions, HostAndPort, Namespace, RemoteClient};

/// Tails a remote oplog from a starting timestamp
#[derive(Clone)]
pub struct OplogFetcher {
    fetcher: QueryFetcher,
    start_ts: Timestamp,
}

impl OplogFetcher {
    /// Create an oplog fetcher starting at `start_ts`
    ///
    /// `work` receives every non-empty batch after the first-batch check,
    /// and the terminal error if the fetch fails.
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        start_ts: Timestamp,
        source: HostAndPort,
        oplog_ns: Namespace,
        work: BatchCallback,
    ) -> Self {
        let options = FindOptions {
            filter: Some(json!({ "ts": { "$gte": start_ts.0 } })),
            ..Default::default()
        };
        let validating: BatchCallback = Arc::new(move |result: Result<Batch>| {
            let work = Arc::clone(&work);
            Box::pin(async move {
                match result {
                    Ok(batch) => {
                        if batch.first {
                            let found = batch.documents.first().and_then(entry_timestamp);
                            if found != Some(start_ts) {
                                let found = found
                                    .map(|ts| ts.to_string())
                                    .unwrap_or_else(|| "no entry".to_string());
                                let _ = work(Err(Error::OplogStartMissing(format!(
                                    "first returned entry ({}) is not where we wanted to start: {}",
                                    found, start_ts
                                ))))
                                .await;
                                return NextAction::NoAction;
                            }
                        }
                        if batch.documents.is_empty() {
                            // Empty follow-up batch, nothing to deliver.
                            return NextAction::GetMore;
                        }
                        work(Ok(batch)).await
                    }
                    Err(e) => work(Err(e)).await,
                }
            })
        });
        Self {
            fetcher: QueryFetcher::new(remote, source, oplog_ns, options, validating),
            start_ts,
        }
    }

    /// The timestamp this fetcher was asked to start at
    pub fn start_timestamp(&self) -> Timestamp {
        self.start_ts
    }

    /// Begin fetching. Fails if already scheduled.
    pub fn schedule(&self) -> Result<()> {
        self.fetcher.schedule()
    }

    /// Abort the in-flight request
    pub fn cancel(&self) {
        self.fetcher.cancel();
    }

    /// Wait until no callback remains in flight
    pub async fn wait(&self) {
        self.fetcher.wait().await;
    }

    /// True between `schedule` and the terminal callback
    pub fn is_active(&self) -> bool {
        self.fetcher.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CursorBatch;
    use crate::testutil::{op_doc, ScriptedRemote};
    use parking_lot::Mutex;

    fn source() -> HostAndPort {
        HostAndPort::new("primary", 27017)
    }

    fn oplog_ns() -> Namespace {
        Namespace::new("local", "oplog.rs")
    }

    fn collecting_callback(log: Arc<Mutex<Vec<Result<Batch>>>>) -> BatchCallback {
        Arc::new(move |result| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().push(result);
                NextAction::GetMore
            })
        })
    }

    async fn run_fetcher(remote: Arc<ScriptedRemote>, start: Timestamp) -> Vec<Result<Batch>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fetcher = OplogFetcher::new(
            remote,
            start,
            source(),
            oplog_ns(),
            collecting_callback(Arc::clone(&log)),
        );
        fetcher.schedule().unwrap();
        fetcher.wait().await;
        let results = log.lock().drain(..).collect();
        results
    }

    #[tokio::test]
    async fn test_first_batch_at_start_is_forwarded() {
        let remote = ScriptedRemote::new();
        remote.push_find(Ok(CursorBatch {
            cursor_id: 3,
            documents: vec![op_doc(5), op_doc(6)],
        }));
        remote.push_get_more(Ok(CursorBatch {
            cursor_id: 0,
            documents: vec![op_doc(7)],
        }));

        let log = run_fetcher(remote.clone(), Timestamp::new(5)).await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].as_ref().unwrap().documents.len(), 2);

        // The oplog query asks for everything at or after the start.
        let (_, _, options) = remote.finds().pop().unwrap();
        assert_eq!(
            options.filter.unwrap(),
            serde_json::json!({ "ts": { "$gte": 5 } })
        );
    }

    #[tokio::test]
    async fn test_empty_first_batch_is_start_missing() {
        let remote = ScriptedRemote::new();
        remote.push_find(Ok(CursorBatch {
            cursor_id: 3,
            documents: vec![],
        }));

        let log = run_fetcher(remote.clone(), Timestamp::new(5)).await;
        assert_eq!(log.len(), 1);
        assert!(matches!(log[0], Err(Error::OplogStartMissing(_))));
        // The forced NoAction stops the sequence before any get-more.
        assert!(remote.get_mores().is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_first_timestamp_is_start_missing() {
        let remote = ScriptedRemote::new();
        remote.push_find(Ok(CursorBatch {
            cursor_id: 3,
            documents: vec![op_doc(500)],
        }));

        let log = run_fetcher(remote, Timestamp::new(100)).await;
        assert_eq!(log.len(), 1);
        match &log[0] {
            Err(Error::OplogStartMissing(msg)) => {
                assert!(msg.contains("500"));
                assert!(msg.contains("100"));
            }
            other => panic!("expected OplogStartMissing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_follow_up_batch_not_delivered() {
        let remote = ScriptedRemote::new();
        remote.push_find(Ok(CursorBatch {
            cursor_id: 3,
            documents: vec![op_doc(5)],
        }));
        remote.push_get_more(Ok(CursorBatch {
            cursor_id: 3,
            documents: vec![],
        }));
        remote.push_get_more(Ok(CursorBatch {
            cursor_id: 0,
            documents: vec![op_doc(6)],
        }));

        let log = run_fetcher(remote, Timestamp::new(5)).await;
        // The empty middle batch is swallowed.
        assert_eq!(log.len(), 2);
        assert_eq!(
            entry_timestamp(&log[1].as_ref().unwrap().documents[0]),
            Some(Timestamp::new(6))
        );
    }

    #[tokio::test]
    async fn test_fetch_error_forwarded() {
        let remote = ScriptedRemote::new();
        remote.push_find(Err(Error::Network("unreachable".into())));

        let log = run_fetcher(remote, Timestamp::new(5)).await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], Err(Error::Network("unreachable".into())));
    }
}
