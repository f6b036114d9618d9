//! One-Shot Events
//!
//! Completion and cancellation signals shared between the replicator and
//! its subtasks. Signaling is sticky: waiters that arrive after the signal
//! return immediately.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// A one-shot event that can be signaled once and awaited by any number
/// of tasks
#[derive(Debug, Clone)]
pub struct Event {
    tx: Arc<watch::Sender<bool>>,
}

impl Event {
    /// Create a new unsignaled event
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal the event, waking all current and future waiters
    pub fn signal(&self) {
        self.tx.send_replace(true);
    }

    /// Check whether the event has been signaled
    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the event is signaled
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Race a future against this event. Returns `CallbackCanceled` when
    /// the event fires first, otherwise the future's result.
    pub async fn race<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.wait() => Err(Error::CallbackCanceled),
            result = fut => result,
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_before_wait() {
        let event = Event::new();
        event.signal();
        assert!(event.is_signaled());
        event.wait().await;
    }

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let event = Event::new();
        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.signal();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_race_cancellation() {
        let event = Event::new();
        event.signal();
        let result: Result<()> = event.race(std::future::pending()).await;
        assert_eq!(result, Err(Error::CallbackCanceled));
    }

    #[tokio::test]
    async fn test_race_completion() {
        let event = Event::new();
        let result = event.race(async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
