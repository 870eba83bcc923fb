//! Tasks, their run context and per-task completion delivery.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::types::STATUS_RUNNING;
use crate::{Observer, TaskError, TaskOutcome, TaskStatus};

/// Boxed future returned by a task function.
pub(crate) type TaskFuture = BoxFuture<'static, TaskOutcome>;

/// Type-erased task function.
///
/// Called once per run with a fresh [`TaskContext`]. The returned outcome
/// decides whether and when the task runs again.
pub(crate) type TaskFunction = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// Handle given to a running task function.
#[derive(Debug, Clone)]
pub struct TaskContext {
    name: String,
    updates: mpsc::UnboundedSender<String>,
}

impl TaskContext {
    /// Name of the running task.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the task's descriptive status while it runs.
    ///
    /// Advisory only; scheduling is unaffected. Updates sent after the run
    /// has finished are dropped.
    pub fn set_status(&self, status: impl Into<String>) {
        let _ = self.updates.send(status.into());
    }
}

/// Latest run result held for a [`Completion`].
#[derive(Debug, Clone, Default)]
pub(crate) struct RunSlot {
    /// Number of finished runs.
    run: u64,
    /// Result of run number `run`; cleared when the next run starts.
    outcome: Option<Result<(), TaskError>>,
}

/// Receives the result of a task's runs.
///
/// Only the most recent undelivered result is kept: a result that was not
/// read before the task ran again is discarded. Never blocks the scheduler.
#[derive(Debug)]
pub struct Completion {
    rx: watch::Receiver<RunSlot>,
    seen: u64,
}

impl Completion {
    /// Wait for the next run result not yet returned by this receiver.
    ///
    /// Returns `None` when the task was removed, replaced or expired without a
    /// newer result to report.
    pub async fn recv(&mut self) -> Option<Result<(), TaskError>> {
        let seen = self.seen;
        let slot = self
            .rx
            .wait_for(|slot| slot.run > seen && slot.outcome.is_some())
            .await
            .ok()?;
        self.seen = slot.run;
        slot.outcome.clone()
    }
}

/// A named unit of work owned by the scheduler loop.
pub(crate) struct Task {
    pub(crate) status: TaskStatus,
    function: TaskFunction,
    slot: watch::Sender<RunSlot>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new(
        name: String,
        function: TaskFunction,
        next_update: DateTime<Utc>,
    ) -> (Self, Completion) {
        let (slot, rx) = watch::channel(RunSlot::default());
        let task = Self {
            status: TaskStatus::added(name, next_update),
            function,
            slot,
        };
        (task, Completion { rx, seen: 0 })
    }

    pub(crate) fn name(&self) -> &str {
        &self.status.name
    }

    /// Run the task function once and record its outcome.
    ///
    /// Panics in the function are caught and reported as
    /// [`TaskError::Panicked`].
    pub(crate) async fn run(&mut self, observer: &dyn Observer) {
        // drop a result nobody read; the slot only reflects the latest run
        self.slot.send_modify(|slot| slot.outcome = None);

        self.status.status = STATUS_RUNNING.to_string();
        observer.on_task_started(&self.status);

        let (updates, mut updates_rx) = mpsc::unbounded_channel();
        let context = TaskContext {
            name: self.status.name.clone(),
            updates,
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| (self.function)(context))) {
            Ok(future) => {
                let run = AssertUnwindSafe(future).catch_unwind();
                tokio::pin!(run);
                loop {
                    tokio::select! {
                        biased;
                        Some(status) = updates_rx.recv() => self.set_status(status, observer),
                        outcome = &mut run => break outcome.unwrap_or_else(panicked),
                    }
                }
            }
            Err(payload) => panicked(payload),
        };

        while let Ok(status) = updates_rx.try_recv() {
            self.set_status(status, observer);
        }

        self.status.record_outcome(&outcome, Utc::now());
        match &outcome.result {
            Ok(result) => observer.on_task_completed(&self.status, result),
            Err(error) => observer.on_task_error(&self.status, error),
        }

        let delivered = outcome.result.map(|_| ());
        self.slot.send_modify(|slot| {
            slot.run += 1;
            slot.outcome = Some(delivered);
        });
    }

    fn set_status(&mut self, status: String, observer: &dyn Observer) {
        self.status.status = status;
        observer.on_task_status_updated(&self.status);
    }
}

fn panicked(payload: Box<dyn Any + Send>) -> TaskOutcome {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    };
    TaskOutcome::failed(TaskError::Panicked(message))
}

/// Erase a concrete task closure into a [`TaskFunction`].
pub(crate) fn boxed<F, Fut>(function: F) -> TaskFunction
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = TaskOutcome> + Send + 'static,
{
    Arc::new(move |context| function(context).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::testing::RecordingObserver;
    use std::time::Duration;

    fn task(function: TaskFunction) -> (Task, Completion) {
        Task::new("probe".to_string(), function, Utc::now())
    }

    #[tokio::test]
    async fn test_run_records_success() {
        let observer = RecordingObserver::default();
        let (mut task, mut completion) =
            task(boxed(|_| async { TaskOutcome::completed("ok") }));

        task.run(&observer).await;

        assert_eq!(task.status.status, "completed: ok");
        assert!(task.status.disabled);
        assert!(task.status.completed.is_some());
        assert_eq!(completion.recv().await, Some(Ok(())));
        assert_eq!(
            observer.events(),
            vec!["started:probe", "completed:probe:ok"]
        );
    }

    #[tokio::test]
    async fn test_run_records_failure_and_keeps_schedule() {
        let observer = RecordingObserver::default();
        let next = Utc::now() + chrono::Duration::seconds(60);
        let (mut task, mut completion) = task(boxed(move |_| async move {
            TaskOutcome::failed(TaskError::msg("boom")).reschedule_at(next)
        }));

        task.run(&observer).await;

        assert_eq!(task.status.status, "error: boom");
        assert_eq!(task.status.next_update, Some(next));
        assert!(!task.status.disabled);
        assert_eq!(
            completion.recv().await,
            Some(Err(TaskError::Failed("boom".to_string())))
        );
    }

    #[tokio::test]
    async fn test_status_updates_reach_observer_in_order() {
        let observer = RecordingObserver::default();
        let (mut task, _completion) = task(boxed(|ctx: TaskContext| async move {
            ctx.set_status("fetching");
            tokio::time::sleep(Duration::from_millis(5)).await;
            ctx.set_status("parsing");
            TaskOutcome::completed("ok")
        }));

        task.run(&observer).await;

        assert_eq!(
            observer.events(),
            vec![
                "started:probe",
                "status:probe:fetching",
                "status:probe:parsing",
                "completed:probe:ok",
            ]
        );
    }

    #[tokio::test]
    async fn test_panic_becomes_task_error() {
        let observer = RecordingObserver::default();
        let (mut task, mut completion) = task(boxed(|_| async {
            if true {
                panic!("kaboom");
            }
            TaskOutcome::completed("never")
        }));

        task.run(&observer).await;

        assert!(task.status.disabled);
        assert_eq!(task.status.status, "error: task panicked: kaboom");
        assert_eq!(
            completion.recv().await,
            Some(Err(TaskError::Panicked("kaboom".to_string())))
        );
    }

    #[tokio::test]
    async fn test_completion_keeps_only_latest_result() {
        let observer = RecordingObserver::default();
        let (mut task, mut completion) = task(boxed(|ctx: TaskContext| async move {
            TaskOutcome::completed(ctx.name().to_string()).reschedule_at(Utc::now())
        }));

        task.run(&observer).await;
        task.run(&observer).await;

        assert_eq!(completion.recv().await, Some(Ok(())));
        // the first run's result was discarded, nothing else is pending
        let pending = tokio::time::timeout(Duration::from_millis(20), completion.recv()).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn test_completion_closes_when_task_dropped() {
        let (task, mut completion) = task(boxed(|_| async { TaskOutcome::completed("ok") }));
        drop(task);
        assert_eq!(completion.recv().await, None);
    }
}
