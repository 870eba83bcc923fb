//! Cooperative single-worker task scheduler.
//!
//! This crate provides an in-process scheduler that:
//! - Holds named tasks that each decide their own next run time
//! - Runs due tasks strictly one at a time on a single control loop
//! - Accepts submissions, removals and stop requests from any caller via
//!   message passing, so the task registry never needs a lock
//! - Reports lifecycle events through a pluggable [`Observer`]
//!
//! State lives in memory only and is lost when the process exits.

mod config;
mod error;
mod observer;
mod registry;
mod scheduler;
mod task;
mod types;

pub use config::{DEFAULT_MIN_WAIT_TIME, SchedulerConfig};
pub use error::{SchedulerError, TaskError};
pub use observer::{NoopObserver, Observer, TracingObserver};
pub use scheduler::Scheduler;
pub use task::{Completion, TaskContext};
pub use types::{EngineState, STATUS_ADDED, STATUS_RUNNING, TaskOutcome, TaskStatus};
