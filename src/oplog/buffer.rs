//! Bounded Oplog Buffer
//!
//! FIFO queue of oplog documents shared between the fetcher (producer) and
//! the applier (consumer). Capacity is accounted in serialized bytes; a
//! full buffer back-pressures the producer.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::oplog::document_size;
use crate::remote::Document;

/// Default buffer capacity, 256 MiB
pub const DEFAULT_BUFFER_CAPACITY_BYTES: usize = 256 * 1024 * 1024;

/// Byte-bounded FIFO of oplog documents
pub struct OplogBuffer {
    capacity: usize,
    queue: Mutex<Queue>,
    space: Notify,
}

#[derive(Default)]
struct Queue {
    docs: VecDeque<(Document, usize)>,
    bytes: usize,
}

impl OplogBuffer {
    /// Create a buffer bounded to `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(Queue::default()),
            space: Notify::new(),
        }
    }

    /// Append a document, waiting for space when the buffer is full
    ///
    /// A document larger than the whole capacity is admitted while the
    /// buffer is empty so a single oversized entry cannot wedge the queue.
    pub async fn push(&self, doc: Document) {
        let size = document_size(&doc);
        loop {
            // Register for space notifications before checking capacity so
            // a pop between the check and the await cannot be missed.
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.queue.lock();
                if queue.bytes + size <= self.capacity || queue.docs.is_empty() {
                    queue.bytes += size;
                    queue.docs.push_back((doc, size));
                    return;
                }
            }
            notified.await;
        }
    }

    /// Append without waiting. Returns false when the document does not fit.
    pub fn try_push(&self, doc: Document) -> bool {
        let size = document_size(&doc);
        let mut queue = self.queue.lock();
        if queue.bytes + size > self.capacity && !queue.docs.is_empty() {
            return false;
        }
        queue.bytes += size;
        queue.docs.push_back((doc, size));
        true
    }

    /// Remove and return the oldest document, if any
    pub fn try_pop(&self) -> Option<Document> {
        let doc = {
            let mut queue = self.queue.lock();
            let (doc, size) = queue.docs.pop_front()?;
            queue.bytes -= size;
            doc
        };
        self.space.notify_waiters();
        Some(doc)
    }

    /// Drop all buffered documents
    pub fn clear(&self) {
        {
            let mut queue = self.queue.lock();
            queue.docs.clear();
            queue.bytes = 0;
        }
        self.space.notify_waiters();
    }

    /// Total serialized size of the buffered documents
    pub fn size_bytes(&self) -> usize {
        self.queue.lock().bytes
    }

    /// Number of buffered documents
    pub fn len(&self) -> usize {
        self.queue.lock().docs.len()
    }

    /// Check whether the buffer holds no documents
    pub fn is_empty(&self) -> bool {
        self.queue.lock().docs.is_empty()
    }
}
