//! Default Database Cloner
//!
//! Copies every collection of one remote database by scanning it with a
//! cursor and bulk-inserting the batches through the storage interface.

use std::sync::Arc;

use serde_json::json;

use crate::cloner::{ClonerFactory, DatabaseCloner};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::remote::{Document, HostAndPort, Namespace, RemoteClient};
use crate::storage::StorageInterface;

/// Clones one database collection by collection
pub struct CollectionScanCloner {
    remote: Arc<dyn RemoteClient>,
    storage: Arc<dyn StorageInterface>,
    source: HostAndPort,
    db: String,
    cancel: Event,
}

impl CollectionScanCloner {
    /// Create a cloner for `db` on `source`
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        storage: Arc<dyn StorageInterface>,
        source: HostAndPort,
        db: impl Into<String>,
    ) -> Self {
        Self {
            remote,
            storage,
            source,
            db: db.into(),
            cancel: Event::new(),
        }
    }

    /// A factory producing collection-scan cloners
    pub fn factory(
        remote: Arc<dyn RemoteClient>,
        storage: Arc<dyn StorageInterface>,
    ) -> ClonerFactory {
        Arc::new(move |source, db| {
            Arc::new(CollectionScanCloner::new(
                Arc::clone(&remote),
                Arc::clone(&storage),
                source.clone(),
                db,
            ))
        })
    }

    async fn clone_collection(&self, ns: &Namespace) -> Result<()> {
        self.storage.create_collection(ns).await?;
        let mut cursor_id: Option<u64> = None;
        loop {
            let batch = match cursor_id {
                None => {
                    self.cancel
                        .race(self.remote.find(&self.source, ns, Default::default()))
                        .await?
                }
                Some(id) => {
                    self.cancel
                        .race(self.remote.get_more(&self.source, ns, id))
                        .await?
                }
            };
            if !batch.documents.is_empty() {
                self.storage.insert_documents(ns, batch.documents).await?;
            }
            if batch.cursor_id == 0 {
                return Ok(());
            }
            cursor_id = Some(batch.cursor_id);
        }
    }
}

#[async_trait::async_trait]
impl DatabaseCloner for CollectionScanCloner {
    fn db_name(&self) -> &str {
        &self.db
    }

    async fn run(&self) -> Result<()> {
        let reply = self
            .cancel
            .race(self.remote.run_command(
                &self.source,
                &self.db,
                json!({ "listCollections": 1 }),
            ))
            .await?;
        let collections = parse_collection_names(reply)?;
        for name in collections {
            let ns = Namespace::new(self.db.clone(), name);
            match self.clone_collection(&ns).await {
                Ok(()) => tracing::info!("collection clone finished: {}", ns),
                Err(e) => {
                    tracing::warn!("collection clone of {} failed: {}", ns, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancel.signal();
    }
}

fn parse_collection_names(reply: Document) -> Result<Vec<String>> {
    let ok = reply.get("ok").and_then(Document::as_u64).unwrap_or(0) == 1;
    if !ok {
        return Err(Error::InitialSyncFailure(
            "failed to list collections due to failed server response".into(),
        ));
    }
    reply
        .get("collections")
        .and_then(Document::as_array)
        .ok_or_else(|| {
            Error::FailedToParse("listCollections reply has no collections array".into())
        })?
        .iter()
        .map(|coll| {
            coll.get("name")
                .and_then(Document::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::FailedToParse("collection entry has no name".into()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::CursorBatch;
    use crate::storage::MemoryStorage;
    use crate::testutil::ScriptedRemote;
    use std::time::Duration;

    fn source() -> HostAndPort {
        HostAndPort::new("primary", 27017)
    }

    fn collections_reply(names: &[&str]) -> Document {
        let colls: Vec<Document> = names.iter().map(|n| json!({ "name": n })).collect();
        json!({ "ok": 1, "collections": colls })
    }

    #[tokio::test]
    async fn test_clones_all_collections() {
        let remote = ScriptedRemote::new();
        remote.push_command("listCollections", Ok(collections_reply(&["users", "orders"])));
        // users: two batches, orders: one.
        remote.push_find(Ok(CursorBatch {
            cursor_id: 5,
            documents: vec![json!({"_id": 1}), json!({"_id": 2})],
        }));
        remote.push_get_more(Ok(CursorBatch {
            cursor_id: 0,
            documents: vec![json!({"_id": 3})],
        }));
        remote.push_find(Ok(CursorBatch {
            cursor_id: 0,
            documents: vec![json!({"_id": 10})],
        }));

        let storage = Arc::new(MemoryStorage::new());
        let cloner =
            CollectionScanCloner::new(remote, Arc::clone(&storage) as _, source(), "shop");
        cloner.run().await.unwrap();

        assert_eq!(storage.document_count(&Namespace::new("shop", "users")), 3);
        assert_eq!(storage.document_count(&Namespace::new("shop", "orders")), 1);
    }

    #[tokio::test]
    async fn test_empty_collection_created() {
        let remote = ScriptedRemote::new();
        remote.push_command("listCollections", Ok(collections_reply(&["empty"])));
        remote.push_find(Ok(CursorBatch::default()));

        let storage = Arc::new(MemoryStorage::new());
        let cloner =
            CollectionScanCloner::new(remote, Arc::clone(&storage) as _, source(), "shop");
        cloner.run().await.unwrap();

        assert_eq!(storage.namespaces(), vec!["shop.empty".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_stops_scan() {
        let remote = ScriptedRemote::new();
        remote.push_command("listCollections", Ok(collections_reply(&["users"])));
        // No find reply scripted: the scan stays pending until cancel.

        let storage = Arc::new(MemoryStorage::new());
        let cloner = Arc::new(CollectionScanCloner::new(
            remote,
            Arc::clone(&storage) as _,
            source(),
            "shop",
        ));
        let runner = {
            let cloner = Arc::clone(&cloner);
            tokio::spawn(async move { cloner.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        DatabaseCloner::cancel(cloner.as_ref());

        let result = tokio::time::timeout(Duration::from_secs(1), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(Error::CallbackCanceled));
    }

    #[tokio::test]
    async fn test_list_collections_failure() {
        let remote = ScriptedRemote::new();
        remote.push_command("listCollections", Ok(json!({ "ok": 0 })));

        let storage = Arc::new(MemoryStorage::new());
        let cloner =
            CollectionScanCloner::new(remote, Arc::clone(&storage) as _, source(), "shop");
        assert!(matches!(
            cloner.run().await,
            Err(Error::InitialSyncFailure(_))
        ));
    }
}
