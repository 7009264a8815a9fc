//! Task Broker Module
//!
//! The coordination plane for remote work: tasks are persisted rows in the
//! shared store, and every state transition is a conditional update, so the
//! row itself is the lock.
//!
//! ## Matching
//! Two symmetric triggers race and either may fire first:
//! 1. A task entering `waiting` wakes a pull-record parked under its path
//!    (`broker::task_wakeup`).
//! 2. A pull-record entering `working` claims a waiting task under its
//!    prefix and completes itself with the task's descriptor
//!    (`broker::task_pull`).
//!
//! ## Submodules
//! - **`types`**: the task row and its lifecycle states.
//! - **`broker`**: the two matchers and their rollback path.
//! - **`feed`**: the change-feed dispatcher and the deadline purger.
//! - **`handlers`**: the `task.*` request handlers.

pub mod broker;
pub mod feed;
pub mod handlers;
pub mod types;
