//! Worker runtime: turns triggers and fired reminders into updater runs.
//!
//! Each updater id gets a dedicated worker that processes its items one at
//! a time, so an updater's state is never touched by two executions at
//! once, while different updaters make progress concurrently.
//!
//! # Module Structure
//!
//! - [`item`]: The work items routed to workers
//! - [`dispatch`]: Per-updater workers and the [`WorkQueue`] seam
//! - [`processor`]: Executes one item against the updater or backflow calculator
//! - [`poll`]: Scans the store for due reminders

pub mod dispatch;
pub mod item;
pub mod poll;
pub mod processor;

pub use dispatch::{DispatchError, Dispatcher, WorkQueue, WorkerKey};
pub use item::{SubscriptionTrigger, WorkItem};
pub use poll::ReminderPoller;
pub use processor::{ProcessError, WorkItemProcessor};
