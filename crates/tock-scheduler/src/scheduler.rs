//! Scheduler handle and the control loop behind it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::task::{self, Task};
use crate::types::after;
use crate::{
    Completion, EngineState, Observer, SchedulerConfig, SchedulerError, TaskContext, TaskError,
    TaskOutcome, TaskStatus,
};

/// Capacity of the inbound command queue. Submitting into a full queue waits
/// for the loop to drain it.
const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Stand-in for "never" when a wait would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the scheduler whose loop is running the current task.
    static RUNNING_ON: u64;
}

fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait).unwrap_or(now + FAR_FUTURE)
}

/// Requests delivered to the control loop.
enum Command {
    Add(Task),
    Remove(String),
    /// `epoch` names the `start` call this stop targets.
    Stop { epoch: u64, ack: oneshot::Sender<()> },
}

/// Engine state plus a counter bumped by every successful `start`.
#[derive(Debug, Clone, Copy, Default)]
struct Lifecycle {
    state: EngineState,
    epoch: u64,
}

/// Everything the control loop owns. Locked by `start` for the whole run.
struct Engine {
    id: u64,
    registry: Registry,
    commands: mpsc::Receiver<Command>,
    /// Task list read by `Scheduler::list`.
    tasks: watch::Sender<Vec<TaskStatus>>,
    lifecycle: watch::Receiver<Lifecycle>,
    observer: Arc<dyn Observer>,
    min_wait_time: Duration,
    task_ttl: Option<Duration>,
    epoch: u64,
}

impl Engine {
    /// Alternate run and wait phases until a stop request is accepted.
    async fn run(&mut self) {
        self.observer.on_start();
        info!(tasks = self.registry.len(), "scheduler starting");

        loop {
            self.run_due().await;
            if self.stop_requested() || !self.wait().await {
                break;
            }
        }
    }

    /// Whether `stop` was called for this run, possibly by one of its tasks.
    fn stop_requested(&self) -> bool {
        let lifecycle = *self.lifecycle.borrow();
        lifecycle.state == EngineState::Stopping && lifecycle.epoch == self.epoch
    }

    fn publish(&self) {
        self.tasks.send_replace(self.registry.snapshot());
    }

    /// Run every due task, one at a time, earliest-due first.
    async fn run_due(&mut self) {
        let expired = self.registry.prune_expired(self.task_ttl, Utc::now());
        if !expired.is_empty() {
            debug!(?expired, "dropped expired tasks");
            self.publish();
        }

        let publisher = Publisher {
            observer: self.observer.as_ref(),
            tasks: &self.tasks,
        };
        for name in self.registry.run_order() {
            let Some(task) = self.registry.get_mut(&name) else {
                continue;
            };
            if task.status.is_due(Utc::now()) {
                RUNNING_ON.scope(self.id, task.run(&publisher)).await;
            }
        }
    }

    /// Sleep until the next task is due, applying commands as they arrive.
    ///
    /// The `min_wait_time` ceiling is fixed when the wait begins; commands
    /// can only bring the wake-up closer. Returns `false` once a stop for the
    /// current run has been requested.
    async fn wait(&mut self) -> bool {
        let ceiling = deadline_after(self.min_wait_time);
        loop {
            let until_due = self.registry.wait_time(self.min_wait_time, Utc::now());
            let deadline = ceiling.min(deadline_after(until_due));
            // a queued stop is acknowledged when the session settles
            if self.stop_requested() {
                return false;
            }
            if Instant::now() >= deadline {
                return true;
            }
            debug!(
                wait_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                "waiting for next task"
            );

            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Stop { epoch, ack }) if epoch == self.epoch => {
                        let _ = ack.send(());
                        return false;
                    }
                    Some(command) => self.apply(command),
                    None => return false,
                },
                _ = sleep_until(deadline) => return true,
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Add(task) => {
                let name = task.name().to_string();
                if self.registry.insert(task).is_some() {
                    debug!(task = %name, "replaced task");
                } else {
                    debug!(task = %name, "registered task");
                }
                self.publish();
            }
            Command::Remove(name) => {
                if self.registry.remove(&name).is_some() {
                    debug!(task = %name, "removed task");
                    self.publish();
                }
            }
            Command::Stop { epoch, ack } => {
                debug!(epoch, current = self.epoch, "acknowledging stop request");
                let _ = ack.send(());
            }
        }
    }

    /// Apply whatever is still queued once the loop stops listening.
    fn settle(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
    }
}

/// Forwards run events to the configured observer and mirrors the running
/// task into the published task list.
struct Publisher<'a> {
    observer: &'a dyn Observer,
    tasks: &'a watch::Sender<Vec<TaskStatus>>,
}

impl Publisher<'_> {
    fn mirror(&self, task: &TaskStatus) {
        self.tasks.send_modify(|tasks| {
            if let Some(entry) = tasks.iter_mut().find(|entry| entry.name == task.name) {
                *entry = task.clone();
            }
        });
    }
}

impl Observer for Publisher<'_> {
    fn on_start(&self) {
        self.observer.on_start();
    }

    fn on_task_added(&self, task: &TaskStatus) {
        self.observer.on_task_added(task);
    }

    fn on_task_started(&self, task: &TaskStatus) {
        self.mirror(task);
        self.observer.on_task_started(task);
    }

    fn on_task_status_updated(&self, task: &TaskStatus) {
        self.mirror(task);
        self.observer.on_task_status_updated(task);
    }

    fn on_task_completed(&self, task: &TaskStatus, result: &str) {
        self.mirror(task);
        self.observer.on_task_completed(task, result);
    }

    fn on_task_error(&self, task: &TaskStatus, error: &TaskError) {
        self.mirror(task);
        self.observer.on_task_error(task, error);
    }
}

/// An active `start` call. Dropping it, normally or by cancellation,
/// returns the scheduler to `Stopped`.
struct Session<'a> {
    lifecycle: &'a watch::Sender<Lifecycle>,
    engine: Option<MutexGuard<'a, Engine>>,
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.settle();
        }
        self.lifecycle
            .send_modify(|lifecycle| lifecycle.state = EngineState::Stopped);
        info!("scheduler stopped");
    }
}

struct Shared {
    id: u64,
    commands: mpsc::Sender<Command>,
    tasks: watch::Receiver<Vec<TaskStatus>>,
    engine: Mutex<Engine>,
    lifecycle: watch::Sender<Lifecycle>,
    observer: Arc<dyn Observer>,
}

/// Handle to a single-worker task scheduler.
///
/// Cloning is cheap and every clone drives the same engine. Tasks run one at
/// a time inside [`start`](Scheduler::start); every other method only sends
/// a message to that loop.
///
/// ```no_run
/// # async fn demo() {
/// use std::time::Duration;
/// use tock_scheduler::{Scheduler, SchedulerConfig, TaskOutcome};
///
/// let scheduler = Scheduler::new(SchedulerConfig::default());
/// let mut done = scheduler
///     .submit("health-check", |_ctx| async {
///         TaskOutcome::completed("healthy").reschedule_in(Duration::from_secs(30))
///     })
///     .await;
///
/// let engine = scheduler.clone();
/// tokio::spawn(async move { engine.start().await });
///
/// assert_eq!(done.recv().await, Some(Ok(())));
/// scheduler.stop().await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler {
    /// Create a stopped scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        let config = config.normalized();
        let id = NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed);
        let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (tasks, tasks_rx) = watch::channel(Vec::new());
        let lifecycle = watch::Sender::new(Lifecycle::default());
        let engine = Engine {
            id,
            registry: Registry::default(),
            commands: commands_rx,
            tasks,
            lifecycle: lifecycle.subscribe(),
            observer: Arc::clone(&config.observer),
            min_wait_time: config.min_wait_time,
            task_ttl: config.task_ttl,
            epoch: 0,
        };

        Self {
            shared: Arc::new(Shared {
                id,
                commands,
                tasks: tasks_rx,
                engine: Mutex::new(engine),
                lifecycle,
                observer: config.observer,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.shared.lifecycle.borrow().state
    }

    /// Run `function` as soon as possible under `name`.
    pub async fn submit<F, Fut>(&self, name: impl Into<String>, function: F) -> Completion
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.submit_at(name, function, Utc::now()).await
    }

    /// Run `function` under `name` once `delay` has passed.
    pub async fn submit_in<F, Fut>(
        &self,
        name: impl Into<String>,
        function: F,
        delay: Duration,
    ) -> Completion
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.submit_at(name, function, after(Utc::now(), delay))
            .await
    }

    /// Run `function` under `name` at or after `at`.
    ///
    /// Replaces any task already registered under `name`. The task is queued
    /// for the loop, so it may not appear in [`list`](Scheduler::list) right
    /// away. Waits while the command queue is full.
    #[tracing::instrument(skip_all, fields(task, at = %at))]
    pub async fn submit_at<F, Fut>(
        &self,
        name: impl Into<String>,
        function: F,
        at: DateTime<Utc>,
    ) -> Completion
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        let name = name.into();
        tracing::Span::current().record("task", name.as_str());

        let (task, completion) = Task::new(name, task::boxed(function), at);
        let status = task.status.clone();

        if self.shared.commands.send(Command::Add(task)).await.is_err() {
            warn!("command queue closed, task dropped");
        }
        self.shared.observer.on_task_added(&status);

        completion
    }

    /// Ask the loop to forget `name`. Unknown names are ignored.
    pub async fn remove(&self, name: impl Into<String>) {
        let name = name.into();
        if self.shared.commands.send(Command::Remove(name)).await.is_err() {
            warn!("command queue closed, remove dropped");
        }
    }

    /// Status of every registered task, ordered by name.
    ///
    /// Never waits for the loop, so tasks may list their own scheduler. While
    /// the engine runs this is the list the loop last published, including
    /// status updates from the running task; commands still queued show up
    /// once the loop applies them. While stopped, queued commands are applied
    /// first.
    pub async fn list(&self) -> Vec<TaskStatus> {
        if let Ok(mut engine) = self.shared.engine.try_lock() {
            engine.settle();
        }
        self.shared.tasks.borrow().clone()
    }

    /// Run the engine until [`stop`](Scheduler::stop) is called.
    ///
    /// Fails with [`SchedulerError::InvalidState`] unless the scheduler is
    /// stopped. Dropping the returned future also stops the engine.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let epoch = self.transition(EngineState::Stopped, EngineState::Started)?;

        let mut session = Session {
            lifecycle: &self.shared.lifecycle,
            engine: None,
        };
        let engine = session.engine.insert(self.shared.engine.lock().await);
        engine.epoch = epoch;
        engine.run().await;

        Ok(())
    }

    /// Request a graceful shutdown.
    ///
    /// Resolves once the loop has accepted the request, which happens only
    /// after the current run phase, including any executing task, has
    /// finished. Does not wait for the state to reach `Stopped`; await the
    /// `start` future for that. Fails unless the scheduler is started.
    ///
    /// Called from one of this scheduler's own tasks, it only records the
    /// request and returns; the loop stops once that task has returned.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let epoch = self.transition(EngineState::Started, EngineState::Stopping)?;
        if self.called_from_task() {
            debug!(epoch, "stop requested by a running task");
            return Ok(());
        }
        let mut lifecycle = self.shared.lifecycle.subscribe();

        let (ack, accepted) = oneshot::channel();
        let request = async {
            if self
                .shared
                .commands
                .send(Command::Stop { epoch, ack })
                .await
                .is_ok()
            {
                let _ = accepted.await;
            }
        };

        tokio::select! {
            _ = request => {}
            // the loop went away without reading the request
            _ = lifecycle.wait_for(|l| l.state == EngineState::Stopped || l.epoch != epoch) => {}
        }

        Ok(())
    }

    fn called_from_task(&self) -> bool {
        RUNNING_ON
            .try_with(|id| *id == self.shared.id)
            .unwrap_or(false)
    }

    /// Move from `from` to `to`, returning the epoch of the current run.
    fn transition(&self, from: EngineState, to: EngineState) -> Result<u64, SchedulerError> {
        let mut actual = from;
        let mut epoch = 0;
        let changed = self.shared.lifecycle.send_if_modified(|lifecycle| {
            if lifecycle.state != from {
                actual = lifecycle.state;
                return false;
            }
            if to == EngineState::Started {
                lifecycle.epoch += 1;
            }
            lifecycle.state = to;
            epoch = lifecycle.epoch;
            true
        });

        if changed {
            Ok(epoch)
        } else {
            Err(SchedulerError::InvalidState {
                expected: from,
                actual,
            })
        }
    }
}
