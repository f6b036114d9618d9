//! Storage Interface
//!
//! The surface the replicator and the cloners need from the local storage
//! layer, plus an in-memory implementation for tests and embedders that do
//! not bring their own.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::Result;
use crate::remote::{Document, Namespace};

/// Storage operations used by the replicator and the database cloners
#[async_trait::async_trait]
pub trait StorageInterface: Send + Sync {
    /// Drop all user databases. Used by resync before a fresh initial sync.
    async fn drop_user_databases(&self) -> Result<()>;

    /// Insert a single document fetched to fill a hole during initial sync.
    /// Implementations serialize this with concurrent writers to `ns`.
    async fn insert_missing_doc(&self, ns: &Namespace, doc: Document) -> Result<()>;

    /// Create `ns` if it does not exist
    async fn create_collection(&self, ns: &Namespace) -> Result<()>;

    /// Bulk-insert cloned documents into `ns`
    async fn insert_documents(&self, ns: &Namespace, docs: Vec<Document>) -> Result<()>;
}

/// In-memory storage keyed by namespace
#[derive(Default)]
pub struct MemoryStorage {
    collections: Mutex<HashMap<String, Vec<Document>>>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents held in `ns`
    pub fn document_count(&self, ns: &Namespace) -> usize {
        self.collections
            .lock()
            .get(&ns.to_string())
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Snapshot of the documents in `ns`
    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.collections
            .lock()
            .get(&ns.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// All namespaces currently present
    pub fn namespaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl StorageInterface for MemoryStorage {
    async fn drop_user_databases(&self) -> Result<()> {
        self.collections.lock().clear();
        Ok(())
    }

    async fn insert_missing_doc(&self, ns: &Namespace, doc: Document) -> Result<()> {
        self.collections
            .lock()
            .entry(ns.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    async fn create_collection(&self, ns: &Namespace) -> Result<()> {
        self.collections.lock().entry(ns.to_string()).or_default();
        Ok(())
    }

    async fn insert_documents(&self, ns: &Namespace, docs: Vec<Document>) -> Result<()> {
        self.collections
            .lock()
            .entry(ns.to_string())
            .or_default()
            .extend(docs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_storage_basic() {
        let storage = MemoryStorage::new();
        let ns = Namespace::new("shop", "orders");

        storage.create_collection(&ns).await.unwrap();
        assert_eq!(storage.document_count(&ns), 0);

        storage
            .insert_documents(&ns, vec![json!({"_id": 1}), json!({"_id": 2})])
            .await
            .unwrap();
        storage.insert_missing_doc(&ns, json!({"_id": 3})).await.unwrap();
        assert_eq!(storage.document_count(&ns), 3);
        assert_eq!(storage.namespaces(), vec!["shop.orders".to_string()]);

        storage.drop_user_databases().await.unwrap();
        assert_eq!(storage.document_count(&ns), 0);
    }
}
