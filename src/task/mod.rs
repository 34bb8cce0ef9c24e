//! Task execution substrate
//!
//! - [`TaskGroup`]: many asynchronous units run as one logical unit that
//!   fails atomically
//! - [`Worker`]: a dedicated thread with a start/stop lifecycle and an
//!   event-driven kick signal

pub mod group;
pub mod worker;

pub use group::{TaskGroup, TaskId};
pub use worker::{Worker, WorkerControl};
