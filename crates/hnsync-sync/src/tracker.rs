//! Per-source run-state rows. Every transition holds the row's lock for the
//! whole check-and-mutate, so readers never see a half-applied state.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use hnsync_core::{RunState, RunStatus, SourceKind};
use tracing::debug;

use crate::SyncError;

#[derive(Debug, Default)]
pub struct RunTracker {
    scraper: Mutex<RunState>,
    api: Mutex<RunState>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn row(&self, source: SourceKind) -> MutexGuard<'_, RunState> {
        let row = match source {
            SourceKind::Scraper => &self.scraper,
            SourceKind::Api => &self.api,
        };
        // Transitions never panic mid-update, so a poisoned row is still consistent.
        row.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle/Failed -> Active. Rejects a second concurrent run for the same source.
    pub fn activate(&self, source: SourceKind) -> Result<RunState, SyncError> {
        let mut row = self.row(source);
        if row.status == RunStatus::Active {
            return Err(SyncError::AlreadyActive(source));
        }
        row.status = RunStatus::Active;
        row.last_run_at = Some(Utc::now());
        debug!(%source, "run state -> active");
        Ok(row.clone())
    }

    /// Active -> Idle. No-op for a row that is not Active.
    pub fn finish(&self, source: SourceKind) -> RunState {
        self.settle(source, RunStatus::Idle)
    }

    /// Active -> Failed. No-op for a row that is not Active.
    pub fn fail(&self, source: SourceKind) -> RunState {
        self.settle(source, RunStatus::Failed)
    }

    fn settle(&self, source: SourceKind, to: RunStatus) -> RunState {
        let mut row = self.row(source);
        if row.status == RunStatus::Active {
            row.status = to;
            row.last_run_finish_at = Some(Utc::now());
            debug!(%source, status = ?to, "run state settled");
        }
        row.clone()
    }

    pub fn status(&self, source: SourceKind) -> RunState {
        self.row(source).clone()
    }

    pub fn any_active(&self) -> bool {
        SourceKind::ALL
            .into_iter()
            .any(|source| self.row(source).is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn second_activate_is_rejected() {
        let tracker = RunTracker::new();
        let first = tracker.activate(SourceKind::Api).unwrap();
        assert_eq!(first.status, RunStatus::Active);
        assert!(first.last_run_at.is_some());

        let err = tracker.activate(SourceKind::Api).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyActive(SourceKind::Api)));
    }

    #[test]
    fn sources_are_independent() {
        let tracker = RunTracker::new();
        tracker.activate(SourceKind::Scraper).unwrap();
        tracker.activate(SourceKind::Api).unwrap();
        tracker.fail(SourceKind::Api);

        assert_eq!(tracker.status(SourceKind::Scraper).status, RunStatus::Active);
        assert_eq!(tracker.status(SourceKind::Api).status, RunStatus::Failed);
        assert!(tracker.any_active());
    }

    #[test]
    fn finish_and_fail_are_idempotent() {
        let tracker = RunTracker::new();
        tracker.activate(SourceKind::Scraper).unwrap();
        let failed = tracker.fail(SourceKind::Scraper);
        assert_eq!(failed.status, RunStatus::Failed);
        let finish_at = failed.last_run_finish_at;

        let again = tracker.finish(SourceKind::Scraper);
        assert_eq!(again.status, RunStatus::Failed);
        assert_eq!(again.last_run_finish_at, finish_at);

        let idle = RunTracker::new().finish(SourceKind::Api);
        assert_eq!(idle.status, RunStatus::Idle);
        assert!(idle.last_run_finish_at.is_none());
    }

    #[test]
    fn failed_source_can_be_reactivated() {
        let tracker = RunTracker::new();
        tracker.activate(SourceKind::Api).unwrap();
        tracker.fail(SourceKind::Api);
        assert!(tracker.activate(SourceKind::Api).is_ok());
    }

    #[test]
    fn concurrent_activation_admits_exactly_one() {
        let tracker = Arc::new(RunTracker::new());
        let handles = (0..16)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || tracker.activate(SourceKind::Scraper).is_ok())
            })
            .collect::<Vec<_>>();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
