//! Bounded fan-out of work units with a deadline-bounded fan-in.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::SyncError;

/// Stand-in deadline when the budget does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Upper bound on how long a caller waits for a dispatched batch.
///
/// The bound equals the sum of a linear schedule `step, 2*step, ..., max_polls*step`,
/// so the worst-case wait matches a poll loop with linearly increasing sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    pub max_polls: u32,
    pub poll_step: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            max_polls: 10,
            poll_step: Duration::from_secs(5),
        }
    }
}

impl JoinPolicy {
    /// Saturates at `Duration::MAX` instead of overflowing.
    pub fn budget(&self) -> Duration {
        let n = u64::from(self.max_polls);
        let steps = n.checked_mul(n + 1).map_or(u64::MAX, |v| v / 2);
        self.poll_step
            .saturating_mul(u32::try_from(steps).unwrap_or(u32::MAX))
    }

    fn deadline(&self, from: Instant) -> Instant {
        from.checked_add(self.budget())
            .unwrap_or_else(|| from + FAR_FUTURE)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FanOutCoordinator {
    width: usize,
    join: JoinPolicy,
}

impl FanOutCoordinator {
    pub fn new(width: usize, join: JoinPolicy) -> Self {
        Self {
            width: width.max(1),
            join,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Spawns one task per unit; at most `width` run `work` at the same time.
    /// Returns immediately; results are collected through [`FanOutHandle::join`].
    pub fn dispatch<U, T, F, Fut>(&self, units: impl IntoIterator<Item = U>, work: F) -> FanOutHandle<T>
    where
        U: Send + 'static,
        T: Send + 'static,
        F: Fn(U) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(self.width));
        let work = Arc::new(work);
        let mut tasks = JoinSet::new();
        let mut total = 0usize;
        for (index, unit) in units.into_iter().enumerate() {
            let permits = Arc::clone(&permits);
            let work = Arc::clone(&work);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::Worker("fan-out permits closed".into()))?;
                work(unit).await.map(|value| (index, value))
            });
            total += 1;
        }
        debug!(total, width = self.width, "dispatched work units");
        FanOutHandle {
            tasks,
            total,
            policy: self.join,
        }
    }
}

/// Completion handle for one dispatched batch.
pub struct FanOutHandle<T> {
    tasks: JoinSet<Result<(usize, T), SyncError>>,
    total: usize,
    policy: JoinPolicy,
}

impl<T: Send + 'static> FanOutHandle<T> {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Waits for every unit, returning results in dispatch order.
    ///
    /// The first unit error, a panicked unit, or an exhausted wait budget ends the
    /// join early. Units still running are detached, not aborted: they finish on
    /// their own and their writes stay valid.
    pub async fn join(mut self) -> Result<Vec<T>, SyncError> {
        let waited = self.policy.budget();
        let deadline = self.policy.deadline(Instant::now());
        let mut slots: Vec<Option<T>> = (0..self.total).map(|_| None).collect();
        let mut completed = 0usize;

        loop {
            let next = match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!(completed, total = self.total, ?waited, "fan-in wait exhausted");
                    self.tasks.detach_all();
                    return Err(SyncError::JoinTimeout {
                        completed,
                        total: self.total,
                        waited,
                    });
                }
            };
            match next {
                None => break,
                Some(Ok(Ok((index, value)))) => {
                    slots[index] = Some(value);
                    completed += 1;
                }
                Some(Ok(Err(err))) => {
                    self.tasks.detach_all();
                    return Err(err);
                }
                Some(Err(join_err)) => {
                    self.tasks.detach_all();
                    return Err(SyncError::Worker(join_err.to_string()));
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick() -> JoinPolicy {
        JoinPolicy {
            max_polls: 4,
            poll_step: Duration::from_millis(20),
        }
    }

    #[test]
    fn budget_is_linear_schedule_sum() {
        assert_eq!(JoinPolicy::default().budget(), Duration::from_secs(275));
        assert_eq!(quick().budget(), Duration::from_millis(200));
    }

    #[test]
    fn large_policies_saturate_instead_of_overflowing() {
        let many_polls = JoinPolicy {
            max_polls: 70_000,
            poll_step: Duration::from_secs(1),
        };
        assert_eq!(many_polls.budget(), Duration::from_secs(2_450_035_000));

        let huge = JoinPolicy {
            max_polls: u32::MAX,
            poll_step: Duration::from_secs(u64::MAX),
        };
        assert_eq!(huge.budget(), Duration::MAX);
        let now = Instant::now();
        assert!(huge.deadline(now) > now);
    }

    #[tokio::test]
    async fn huge_budget_still_joins_normally() {
        let policy = JoinPolicy {
            max_polls: u32::MAX,
            poll_step: Duration::from_secs(u64::MAX),
        };
        let handle = FanOutCoordinator::new(2, policy).dispatch(vec![1u8, 2], |n| async move { Ok(n) });
        assert_eq!(handle.join().await.unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn results_come_back_in_dispatch_order() {
        let coordinator = FanOutCoordinator::new(3, quick());
        let handle = coordinator.dispatch(vec![30u64, 10, 20], |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(delay)
        });
        assert_eq!(handle.total(), 3);
        assert_eq!(handle.join().await.unwrap(), vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn width_bounds_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let coordinator = FanOutCoordinator::new(2, quick());
        let handle = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            coordinator.dispatch(0..8, move |_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        handle.join().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn slow_unit_turns_into_join_timeout() {
        let coordinator = FanOutCoordinator::new(4, quick());
        let handle = coordinator.dispatch(vec![1u64, 5_000], |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(delay)
        });
        match handle.join().await {
            Err(SyncError::JoinTimeout { completed, total, .. }) => {
                assert_eq!(completed, 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected JoinTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unit_error_fails_join_but_others_keep_running() {
        let finished = Arc::new(AtomicUsize::new(0));
        let coordinator = FanOutCoordinator::new(4, quick());
        let handle = {
            let finished = Arc::clone(&finished);
            coordinator.dispatch(vec![0u64, 30], move |delay| {
                let finished = Arc::clone(&finished);
                async move {
                    if delay == 0 {
                        return Err(SyncError::Worker("boom".into()));
                    }
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(delay)
                }
            })
        };
        assert!(matches!(handle.join().await, Err(SyncError::Worker(_))));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
