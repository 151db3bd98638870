//! Tasks, subscriber sets, and the activity feed.

pub mod store;
pub mod types;

pub use store::{CreateTaskInput, TaskStore};
pub use types::{Activity, ActivityKind, Task, TaskPriority, TaskStatus};
