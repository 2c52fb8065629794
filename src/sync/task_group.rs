//! Supervised group of tasks.
//!
//! # Responsibilities
//! - Spawn anonymous and named tasks
//! - Answer "is a task with this name still running?"
//! - Cancel every task on teardown and collect how they ended
//!
//! # Design Decisions
//! - Each task receives a child `CancellationToken`; cancellation is
//!   cooperative so tasks can run their cleanup before returning `Err(Cancelled)`
//! - Dropping the group cancels the tokens and aborts whatever is left
//! - Finished tasks are reaped lazily on the next spawn

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Returned by a task that stopped because it was asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task was cancelled")]
pub struct Cancelled;

/// Result every supervised task resolves to.
pub type TaskResult = Result<(), Cancelled>;

/// How the tasks of a group ended during [`TaskGroup::shutdown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GroupStats {
    /// Tasks that returned `Ok(())`.
    pub completed: usize,
    /// Tasks that observed cancellation and returned `Err(Cancelled)`.
    pub cancelled: usize,
    /// Tasks forcibly aborted after the grace period.
    pub aborted: usize,
    /// Tasks that panicked.
    pub panicked: usize,
}

impl GroupStats {
    fn record(&mut self, result: Result<TaskResult, JoinError>) {
        match result {
            Ok(Ok(())) => self.completed += 1,
            Ok(Err(Cancelled)) => self.cancelled += 1,
            Err(e) if e.is_panic() => self.panicked += 1,
            Err(_) => self.aborted += 1,
        }
    }
}

/// A set of tasks whose lifetime is owned by the group.
pub struct TaskGroup {
    token: Mutex<CancellationToken>,
    tasks: Mutex<JoinSet<TaskResult>>,
    named: Mutex<HashMap<String, AbortHandle>>,
}

impl TaskGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            token: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(JoinSet::new()),
            named: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn an anonymous task. The closure receives the task's cancellation token.
    pub fn spawn<F, Fut>(&self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let token = self.cancellation_token();
        let mut tasks = lock(&self.tasks);
        reap(&mut tasks);
        tasks.spawn(task(token));
    }

    /// Spawn a task registered under `name`.
    ///
    /// Returns `false` without spawning when a task with that name is still
    /// running.
    pub fn spawn_with_name<F, Fut>(&self, name: &str, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let mut named = lock(&self.named);
        if named.get(name).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let token = self.cancellation_token();
        let handle = {
            let mut tasks = lock(&self.tasks);
            reap(&mut tasks);
            tasks.spawn(task(token))
        };
        named.insert(name.to_string(), handle);
        true
    }

    /// Whether a task registered under `name` is still running.
    pub fn has(&self, name: &str) -> bool {
        lock(&self.named)
            .get(name)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of tasks that have not been reaped yet.
    pub fn len(&self) -> usize {
        let mut tasks = lock(&self.tasks);
        reap(&mut tasks);
        tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal cancellation to every task spawned so far.
    ///
    /// Tasks spawned afterwards get a fresh token.
    pub fn cancel(&self) {
        let mut token = lock(&self.token);
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Cancel every task and wait up to `grace` for them to finish.
    /// Tasks still running after the grace period are aborted.
    pub async fn shutdown(&self, grace: Duration) -> GroupStats {
        self.cancel();
        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        lock(&self.named).clear();

        let mut stats = GroupStats::default();
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.join_next().await {
                stats.record(result);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Tasks did not finish within grace period, aborting"
            );
            tasks.abort_all();
            while let Some(result) = tasks.join_next().await {
                stats.record(result);
            }
        }

        stats
    }

    /// A token cancelled together with the tasks of this group.
    pub fn cancellation_token(&self) -> CancellationToken {
        lock(&self.token).child_token()
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        lock(&self.token).cancel();
        // The JoinSet aborts its remaining tasks when dropped.
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("tasks", &lock(&self.tasks).len())
            .field("named", &lock(&self.named).keys().collect::<Vec<_>>())
            .finish()
    }
}

fn reap(tasks: &mut JoinSet<TaskResult>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::warn!(error = %e, "Supervised task panicked");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn named_spawn_is_idempotent() {
        let group = TaskGroup::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        assert!(group.spawn_with_name("serve", |_| async move {
            let _ = release_rx.await;
            Ok(())
        }));
        assert!(group.has("serve"));

        // Second spawn under the same name is a no-op.
        assert!(!group.spawn_with_name("serve", |_| async { Ok(()) }));
        assert_eq!(group.len(), 1);

        release_tx.send(()).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!group.has("serve"));

        // Once finished, the name can be reused.
        assert!(group.spawn_with_name("serve", |_| async { Ok(()) }));
    }

    #[tokio::test]
    async fn has_unknown_name() {
        let group = TaskGroup::new();
        group.spawn(|_| async { Ok(()) });
        assert!(!group.has("serve"));
    }

    #[tokio::test]
    async fn shutdown_cancels_cooperative_tasks() {
        let group = TaskGroup::new();
        for _ in 0..3 {
            group.spawn(|cancel| async move {
                cancel.cancelled().await;
                Err(Cancelled)
            });
        }
        group.spawn(|_| async { Ok(()) });

        let stats = group.shutdown(Duration::from_secs(1)).await;
        assert_eq!(stats.cancelled, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.aborted, 0);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_stragglers() {
        let group = TaskGroup::new();
        group.spawn(|_| async {
            std::future::pending::<()>().await;
            Ok(())
        });

        let stats = group.shutdown(Duration::from_millis(20)).await;
        assert_eq!(stats.aborted, 1);
    }

    #[tokio::test]
    async fn cancel_only_reaches_existing_tasks() {
        let group = TaskGroup::new();
        let (seen_tx, seen_rx) = oneshot::channel();
        group.spawn(|cancel| async move {
            cancel.cancelled().await;
            let _ = seen_tx.send(());
            Err(Cancelled)
        });

        group.cancel();
        seen_rx.await.unwrap();

        let (late_tx, mut late_rx) = oneshot::channel::<()>();
        group.spawn(|cancel| async move {
            cancel.cancelled().await;
            drop(late_tx);
            Err(Cancelled)
        });
        tokio::task::yield_now().await;
        assert!(matches!(
            late_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn dropping_group_stops_tasks() {
        let group = TaskGroup::new();
        let (held_tx, held_rx) = oneshot::channel::<()>();
        group.spawn(|_| async move {
            let _held = held_tx;
            std::future::pending::<()>().await;
            Ok(())
        });
        tokio::task::yield_now().await;

        drop(group);
        let result = tokio::time::timeout(Duration::from_secs(1), held_rx).await;
        assert!(matches!(result, Ok(Err(_))), "task should have been dropped");
    }
}
