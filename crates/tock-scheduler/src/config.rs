//! Scheduler configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{NoopObserver, Observer};

/// Default ceiling on a single idle wait.
pub const DEFAULT_MIN_WAIT_TIME: Duration = Duration::from_secs(60 * 60);

/// Settings supplied when building a [`Scheduler`](crate::Scheduler).
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Longest the loop sleeps before re-evaluating, even with nothing due.
    pub min_wait_time: Duration,
    /// How long a disabled task is kept before being dropped. `None` keeps it
    /// forever.
    pub task_ttl: Option<Duration>,
    /// Receives lifecycle events.
    pub observer: Arc<dyn Observer>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_wait_time: DEFAULT_MIN_WAIT_TIME,
            task_ttl: None,
            observer: Arc::new(NoopObserver),
        }
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("min_wait_time", &self.min_wait_time)
            .field("task_ttl", &self.task_ttl)
            .finish_non_exhaustive()
    }
}

impl SchedulerConfig {
    pub fn with_min_wait_time(mut self, min_wait_time: Duration) -> Self {
        self.min_wait_time = min_wait_time;
        self
    }

    pub fn with_task_ttl(mut self, task_ttl: Duration) -> Self {
        self.task_ttl = Some(task_ttl);
        self
    }

    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Replace zero values with their defaults.
    ///
    /// A zero wait ceiling would spin the loop, so it falls back to
    /// [`DEFAULT_MIN_WAIT_TIME`]; a zero TTL means "never expire".
    pub(crate) fn normalized(mut self) -> Self {
        if self.min_wait_time.is_zero() {
            self.min_wait_time = DEFAULT_MIN_WAIT_TIME;
        }
        if self.task_ttl.is_some_and(|ttl| ttl.is_zero()) {
            self.task_ttl = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.min_wait_time, Duration::from_secs(3600));
        assert!(config.task_ttl.is_none());
    }

    #[test]
    fn test_zero_values_fall_back() {
        let config = SchedulerConfig::default()
            .with_min_wait_time(Duration::ZERO)
            .with_task_ttl(Duration::ZERO)
            .normalized();

        assert_eq!(config.min_wait_time, DEFAULT_MIN_WAIT_TIME);
        assert!(config.task_ttl.is_none());
    }

    #[test]
    fn test_builder_keeps_explicit_values() {
        let config = SchedulerConfig::default()
            .with_min_wait_time(Duration::from_millis(500))
            .with_task_ttl(Duration::from_secs(30))
            .normalized();

        assert_eq!(config.min_wait_time, Duration::from_millis(500));
        assert_eq!(config.task_ttl, Some(Duration::from_secs(30)));
    }
}
