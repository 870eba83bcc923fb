//! Name-keyed task storage owned by the scheduler loop.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::TaskStatus;
use crate::task::Task;

/// All tasks known to one scheduler, keyed by name.
///
/// Only the engine loop holds a `Registry`; callers reach it through
/// commands, never directly.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    tasks: HashMap<String, Task>,
}

impl Registry {
    /// Insert a task, replacing any task with the same name.
    pub(crate) fn insert(&mut self, task: Task) -> Option<Task> {
        self.tasks.insert(task.name().to_string(), task)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Task> {
        self.tasks.remove(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.get_mut(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Status of every task, ordered by name.
    pub(crate) fn snapshot(&self) -> Vec<TaskStatus> {
        let mut statuses: Vec<TaskStatus> =
            self.tasks.values().map(|task| task.status.clone()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Names of enabled tasks, earliest next-due time first.
    ///
    /// Ties are broken by name so a pass is deterministic.
    pub(crate) fn run_order(&self) -> Vec<String> {
        let mut pending: Vec<(DateTime<Utc>, &str)> = self
            .tasks
            .values()
            .filter(|task| !task.status.disabled)
            .filter_map(|task| task.status.next_update.map(|next| (next, task.name())))
            .collect();
        pending.sort();
        pending
            .into_iter()
            .map(|(_, name)| name.to_string())
            .collect()
    }

    /// Drop disabled tasks whose TTL has elapsed. Returns the pruned names.
    pub(crate) fn prune_expired(&mut self, ttl: Option<Duration>, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .tasks
            .values()
            .filter(|task| task.status.is_expired(ttl, now))
            .map(|task| task.name().to_string())
            .collect();
        for name in &expired {
            self.tasks.remove(name);
        }
        expired
    }

    /// How long the loop may sleep before the next task is due.
    ///
    /// Never exceeds `ceiling`; zero when something is already due.
    pub(crate) fn wait_time(&self, ceiling: Duration, now: DateTime<Utc>) -> Duration {
        self.tasks
            .values()
            .filter_map(|task| task.status.time_until_due(now))
            .fold(ceiling, Duration::min)
    }
}
