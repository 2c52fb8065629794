//! Task coordination primitives.
//!
//! # Data Flow
//! ```text
//! StreamServer
//!     → Event (started / stopped flags observed by callers)
//!     → TaskGroup ("serve" accept loop + one task per connection)
//!         → CancellationToken per task (cooperative teardown)
//! ```

pub mod event;
pub mod task_group;

pub use event::Event;
pub use task_group::{Cancelled, GroupStats, TaskGroup, TaskResult};
