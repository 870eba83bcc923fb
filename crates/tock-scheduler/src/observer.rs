//! Lifecycle hooks invoked by the scheduler.

use tracing::{error, info};

use crate::{TaskError, TaskStatus};

/// Value of the `pool` field attached to every [`TracingObserver`] event.
const POOL: &str = "tock";

/// Receives scheduler lifecycle events.
///
/// Hooks run synchronously on the scheduler loop (or, for
/// [`on_task_added`](Observer::on_task_added), on the submitting caller), so
/// they must return promptly. Every method defaults to doing nothing.
pub trait Observer: Send + Sync {
    /// The engine entered its run/wait loop.
    fn on_start(&self) {}

    /// A task was submitted. The loop may not have applied it yet.
    fn on_task_added(&self, _task: &TaskStatus) {}

    /// A task function is about to run.
    fn on_task_started(&self, _task: &TaskStatus) {}

    /// A running task pushed a new status via
    /// [`TaskContext::set_status`](crate::TaskContext::set_status).
    fn on_task_status_updated(&self, _task: &TaskStatus) {}

    /// A task run finished successfully.
    fn on_task_completed(&self, _task: &TaskStatus, _result: &str) {}

    /// A task run failed.
    fn on_task_error(&self, _task: &TaskStatus, _error: &TaskError) {}
}

/// Observer that ignores every event. Used when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Observer that emits one structured `tracing` event per lifecycle hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_start(&self) {
        info!(pool = POOL, "task scheduler is starting");
    }

    fn on_task_added(&self, task: &TaskStatus) {
        info!(
            pool = POOL,
            task = %task.name,
            next_update = ?task.next_update,
            "adding task"
        );
    }

    fn on_task_started(&self, task: &TaskStatus) {
        info!(pool = POOL, task = %task.name, "task starts running");
    }

    fn on_task_status_updated(&self, task: &TaskStatus) {
        info!(
            pool = POOL,
            task = %task.name,
            status = %task.status,
            "task status updated"
        );
    }

    fn on_task_completed(&self, task: &TaskStatus, result: &str) {
        info!(
            pool = POOL,
            task = %task.name,
            result,
            next_update = ?task.next_update,
            disabled = task.disabled,
            "task completed"
        );
    }

    fn on_task_error(&self, task: &TaskStatus, error: &TaskError) {
        error!(
            pool = POOL,
            task = %task.name,
            error = %error,
            next_update = ?task.next_update,
            disabled = task.disabled,
            "task failed"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every event as a short string, e.g. `completed:probe:ok`.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        pub(crate) fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Observer for RecordingObserver {
        fn on_start(&self) {
            self.push("start".to_string());
        }

        fn on_task_added(&self, task: &TaskStatus) {
            self.push(format!("added:{}", task.name));
        }

        fn on_task_started(&self, task: &TaskStatus) {
            self.push(format!("started:{}", task.name));
        }

        fn on_task_status_updated(&self, task: &TaskStatus) {
            self.push(format!("status:{}:{}", task.name, task.status));
        }

        fn on_task_completed(&self, task: &TaskStatus, result: &str) {
            self.push(format!("completed:{}:{}", task.name, result));
        }

        fn on_task_error(&self, task: &TaskStatus, error: &TaskError) {
            self.push(format!("error:{}:{}", task.name, error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_observers_accept_every_event() {
        let status = TaskStatus::added("probe", Utc::now());
        let error = TaskError::msg("boom");

        for observer in [&NoopObserver as &dyn Observer, &TracingObserver] {
            observer.on_start();
            observer.on_task_added(&status);
            observer.on_task_started(&status);
            observer.on_task_status_updated(&status);
            observer.on_task_completed(&status, "ok");
            observer.on_task_error(&status, &error);
        }
    }
}
