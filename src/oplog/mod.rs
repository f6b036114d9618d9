//! Oplog Primitives
//!
//! Timestamps, oplog-entry field access, and the bounded buffer that sits
//! between the fetcher and the applier.

mod buffer;

pub use buffer::{OplogBuffer, DEFAULT_BUFFER_CAPACITY_BYTES};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::remote::{Document, Namespace};

/// Position in the oplog's total order
///
/// Values are opaque to the replicator except for their ordering, which is
/// defined by the sync source. The zero timestamp plays the role of "unset".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Create a timestamp from its raw value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Check whether this is the unset timestamp
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Extract the `ts` field of an oplog entry
pub fn entry_timestamp(doc: &Document) -> Option<Timestamp> {
    doc.get("ts").and_then(Document::as_u64).map(Timestamp)
}

/// Extract the target namespace (`ns` field) of an oplog entry
pub fn entry_namespace(doc: &Document) -> Option<Namespace> {
    doc.get("ns")
        .and_then(Document::as_str)
        .and_then(|s| s.parse().ok())
}

/// Extract the id of the document an oplog entry refers to (`o2._id`)
pub fn entry_missing_id(doc: &Document) -> Option<Document> {
    doc.get("o2").and_then(|o| o.get("_id")).cloned()
}

/// Serialized size of a document, used for buffer accounting
pub fn document_size(doc: &Document) -> usize {
    serde_json::to_vec(doc).map(|bytes| bytes.len()).unwrap_or(0)
}
