//! Progress Reporter
//!
//! Pushes the follower's applied position upstream to the sync source so
//! the primary can track replication progress. Reports run on demand and
//! coalesce: a trigger while one is in flight schedules exactly one rerun.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::coordinator::ReplicationCoordinator;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::remote::{HostAndPort, RemoteClient};

/// Reports follower progress to the sync source
#[derive(Clone)]
pub struct Reporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    remote: Arc<dyn RemoteClient>,
    coord: Arc<dyn ReplicationCoordinator>,
    target: HostAndPort,
    state: Mutex<ReporterState>,
    cancel: Event,
}

#[derive(Default)]
struct ReporterState {
    active: bool,
    rerun: bool,
    canceled: bool,
    error: Option<Error>,
    run_done: Option<Event>,
}

impl Reporter {
    /// Create a reporter against `target`
    pub fn new(
        remote: Arc<dyn RemoteClient>,
        coord: Arc<dyn ReplicationCoordinator>,
        target: HostAndPort,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                remote,
                coord,
                target,
                state: Mutex::new(ReporterState::default()),
                cancel: Event::new(),
            }),
        }
    }

    /// Ask for a progress report
    pub fn trigger(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.canceled {
                return;
            }
            if state.active {
                state.rerun = true;
                return;
            }
            state.active = true;
            state.run_done = Some(Event::new());
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run().await;
        });
    }

    /// Stop reporting; an in-flight report is abandoned
    pub fn cancel(&self) {
        self.inner.state.lock().canceled = true;
        self.inner.cancel.signal();
    }

    /// Wait until no report remains in flight
    pub async fn wait(&self) {
        let run_done = self.inner.state.lock().run_done.clone();
        if let Some(event) = run_done {
            event.wait().await;
        }
    }

    /// True while a report is in flight
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Outcome of the most recent report
    pub fn status(&self) -> Result<()> {
        match &self.inner.state.lock().error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl ReporterInner {
    async fn run(&self) {
        loop {
            let optime = self.coord.get_my_last_optime();
            let command = json!({ "updatePosition": 1, "optime": optime.0 });
            let result = self
                .cancel
                .race(self.remote.run_command(&self.target, "admin", command))
                .await;

            let mut state = self.state.lock();
            match result {
                Ok(_) => state.error = None,
                Err(e) => {
                    if !e.is_canceled() {
                        tracing::warn!("progress report to {} failed: {}", self.target, e);
                    }
                    state.error = Some(e);
                }
            }
            if state.rerun && !state.canceled && state.error.is_none() {
                state.rerun = false;
                continue;
            }
            state.active = false;
            if let Some(event) = state.run_done.take() {
                event.signal();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::Timestamp;
    use crate::testutil::{RecordingCoordinator, ScriptedRemote};
    use serde_json::json;
    use std::time::Duration;

    fn target() -> HostAndPort {
        HostAndPort::new("primary", 27017)
    }

    #[tokio::test]
    async fn test_trigger_sends_position() {
        let remote = ScriptedRemote::new();
        remote.push_command("updatePosition", Ok(json!({ "ok": 1 })));
        let coord = Arc::new(RecordingCoordinator::new());
        coord.set_my_last_optime(Timestamp::new(42));

        let reporter = Reporter::new(remote.clone(), coord, target());
        reporter.trigger();
        reporter.wait().await;

        let commands = remote.commands();
        assert_eq!(commands.len(), 1);
        let (host, db, command) = &commands[0];
        assert_eq!(host, &target());
        assert_eq!(db, "admin");
        assert_eq!(command.get("optime").and_then(|v| v.as_u64()), Some(42));
        assert!(reporter.status().is_ok());
        assert!(!reporter.is_active());
    }

    #[tokio::test]
    async fn test_trigger_coalesces_to_one_rerun() {
        let remote = ScriptedRemote::new();
        remote.push_command("updatePosition", Ok(json!({ "ok": 1 })));
        remote.push_command("updatePosition", Ok(json!({ "ok": 1 })));
        let coord = Arc::new(RecordingCoordinator::new());

        let reporter = Reporter::new(remote.clone(), coord, target());
        reporter.trigger();
        reporter.trigger();
        reporter.trigger();
        reporter.wait().await;
        // Give a stray third run time to show up if one was scheduled.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(remote.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_status_recovers_after_successful_report() {
        let remote = ScriptedRemote::new();
        remote.push_command("updatePosition", Err(Error::Network("down".into())));
        remote.push_command("updatePosition", Ok(json!({ "ok": 1 })));
        let coord = Arc::new(RecordingCoordinator::new());

        let reporter = Reporter::new(remote, coord, target());
        reporter.trigger();
        reporter.wait().await;
        assert!(reporter.status().is_err());

        reporter.trigger();
        reporter.wait().await;
        assert!(reporter.status().is_ok());
    }

    #[tokio::test]
    async fn test_failed_report_latches_status() {
        let remote = ScriptedRemote::new();
        remote.push_command("updatePosition", Err(Error::Network("down".into())));
        let coord = Arc::new(RecordingCoordinator::new());

        let reporter = Reporter::new(remote, coord, target());
        reporter.trigger();
        reporter.wait().await;

        assert_eq!(reporter.status(), Err(Error::Network("down".into())));
    }

    #[tokio::test]
    async fn test_cancel_abandons_in_flight_report() {
        let remote = ScriptedRemote::new();
        // No reply scripted: the report stays pending until cancel.
        let coord = Arc::new(RecordingCoordinator::new());

        let reporter = Reporter::new(remote, coord, target());
        reporter.trigger();
        tokio::time::sleep(Duration::from_millis(10)).await;
        reporter.cancel();
        reporter.wait().await;

        assert!(!reporter.is_active());
        reporter.trigger();
        assert!(!reporter.is_active());
    }
}
