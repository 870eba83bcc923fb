//! Scheduler types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TaskError;

/// Status string of a freshly submitted task.
pub const STATUS_ADDED: &str = "added";

/// Status string of a task whose function is executing.
pub const STATUS_RUNNING: &str = "running";

/// Point-in-time description of a task.
///
/// Returned by [`Scheduler::list`](crate::Scheduler::list) and passed to every
/// [`Observer`](crate::Observer) hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Unique task name within the scheduler.
    pub name: String,
    /// Human-readable state, e.g. `added`, `running`, `completed: ...`.
    pub status: String,
    /// When the task next becomes eligible to run. `None` once disabled.
    pub next_update: Option<DateTime<Utc>>,
    /// When the task last finished running.
    pub completed: Option<DateTime<Utc>>,
    /// Set once a run returned no next-due time; the task never runs again.
    pub disabled: bool,
}

impl TaskStatus {
    /// Status of a task that was just submitted.
    pub fn added(name: impl Into<String>, next_update: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            status: STATUS_ADDED.to_string(),
            next_update: Some(next_update),
            completed: None,
            disabled: false,
        }
    }

    /// Whether the task is eligible to run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.disabled {
            return false;
        }
        self.next_update.is_some_and(|next| now >= next)
    }

    /// Whether a disabled task has outlived its retention window at `now`.
    ///
    /// Enabled tasks and tasks without a TTL never expire.
    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        let (Some(ttl), Some(completed)) = (ttl, self.completed) else {
            return false;
        };
        if !self.disabled {
            return false;
        }
        match (now - completed).to_std() {
            Ok(elapsed) => elapsed >= ttl,
            // completed lies in the future
            Err(_) => false,
        }
    }

    /// Time left until the task is due, `Duration::ZERO` if already overdue.
    ///
    /// `None` for tasks without a next-due time.
    pub fn time_until_due(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_update
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Apply the result of a finished run.
    pub(crate) fn record_outcome(&mut self, outcome: &TaskOutcome, finished: DateTime<Utc>) {
        self.completed = Some(finished);
        match outcome.next_update {
            Some(next) => self.next_update = Some(next),
            None => {
                self.disabled = true;
                self.next_update = None;
            }
        }
        self.status = match &outcome.result {
            Ok(result) => format!("completed: {result}"),
            Err(error) => format!("error: {error}"),
        };
    }
}

/// What a task function reports back after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Free-text result on success, or the run's failure.
    pub result: Result<String, TaskError>,
    /// When to run again. `None` disables the task.
    pub next_update: Option<DateTime<Utc>>,
}

impl TaskOutcome {
    /// A successful run that does not reschedule.
    pub fn completed(result: impl Into<String>) -> Self {
        Self {
            result: Ok(result.into()),
            next_update: None,
        }
    }

    /// A failed run that does not reschedule.
    pub fn failed(error: TaskError) -> Self {
        Self {
            result: Err(error),
            next_update: None,
        }
    }

    /// Run again at `at`.
    pub fn reschedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_update = Some(at);
        self
    }

    /// Run again `delay` from now.
    pub fn reschedule_in(self, delay: Duration) -> Self {
        self.reschedule_at(after(Utc::now(), delay))
    }
}

/// `from + delay`, saturating at the latest representable instant.
pub(crate) fn after(from: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| from.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lifecycle state of the scheduler engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Not running; `start` is accepted.
    #[default]
    Stopped,
    /// The run/wait loop is active.
    Started,
    /// Stop requested; the loop is finishing its current run phase.
    Stopping,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Started => "started",
            Self::Stopping => "stopping",
        })
    }
}
