//! Remote Command Surface
//!
//! The contract between the replicator and the network layer that talks to
//! the sync source. Implementations own connections, authentication, and
//! wire encoding; the replicator only sees commands and cursor batches.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A document. Oplog entries, command requests, and command replies are
/// all documents at this boundary.
pub type Document = serde_json::Value;

/// Remote host identifier, `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    /// Create a new host identifier
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostAndPort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::FailedToParse(format!("expected host:port, got '{}'", s)))?;
        if host.is_empty() {
            return Err(Error::FailedToParse(format!("empty host in '{}'", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::FailedToParse(format!("bad port in '{}'", s)))?;
        Ok(Self::new(host, port))
    }
}

/// Fully qualified collection name, `database.collection`
///
/// The collection part may itself contain dots, as oplog collections
/// commonly do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    /// Create a new namespace
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (db, coll) = s
            .split_once('.')
            .ok_or_else(|| Error::FailedToParse(format!("expected db.collection, got '{}'", s)))?;
        if db.is_empty() || coll.is_empty() {
            return Err(Error::FailedToParse(format!("bad namespace '{}'", s)));
        }
        Ok(Self::new(db, coll))
    }
}

/// Options for a remote find command
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Query predicate
    pub filter: Option<Document>,
    /// Sort specification
    pub sort: Option<Document>,
    /// Maximum number of documents to return
    pub limit: Option<u32>,
    /// Preferred batch size
    pub batch_size: Option<u32>,
}

/// One batch of documents from a remote cursor
///
/// A `cursor_id` of zero means the cursor is exhausted and no further
/// batches can be requested.
#[derive(Debug, Clone, Default)]
pub struct CursorBatch {
    pub cursor_id: u64,
    pub documents: Vec<Document>,
}

/// Client for commands and cursors against a remote node
///
/// Calls may be issued from any task and must be safe to run concurrently.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    /// Run a single command against a database on the target node
    async fn run_command(
        &self,
        target: &HostAndPort,
        db: &str,
        command: Document,
    ) -> Result<Document>;

    /// Open a cursor over a collection and return the first batch
    async fn find(
        &self,
        target: &HostAndPort,
        ns: &Namespace,
        options: FindOptions,
    ) -> Result<CursorBatch>;

    /// Fetch the next batch from a previously opened cursor
    async fn get_more(
        &self,
        target: &HostAndPort,
        ns: &Namespace,
        cursor_id: u64,
    ) -> Result<CursorBatch>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let host: HostAndPort = "db1.example.com:27017".parse().unwrap();
        assert_eq!(host.host, "db1.example.com");
        assert_eq!(host.port, 27017);
        assert_eq!(host.to_string(), "db1.example.com:27017");

        assert!("no-port".parse::<HostAndPort>().is_err());
        assert!(":27017".parse::<HostAndPort>().is_err());
        assert!("h:notaport".parse::<HostAndPort>().is_err());
    }

    #[test]
    fn test_parse_namespace() {
        let ns: Namespace = "local.oplog.rs".parse().unwrap();
        assert_eq!(ns.db, "local");
        assert_eq!(ns.coll, "oplog.rs");
        assert_eq!(ns.to_string(), "local.oplog.rs");

        assert!("nodot".parse::<Namespace>().is_err());
        assert!(".coll".parse::<Namespace>().is_err());
    }
}
