//! # TabReport Scheduler
//!
//! Persists report schedules and runs them when they fall due.
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (tokio interval, every tick_secs)
//!   ├── ScheduleStore::list_due(now)       SQLite, WAL
//!   ├── try_claim(lease)                   one worker per job
//!   └── per job, on its own task:
//!         DataSource::fetch → render → ChannelSet::deliver
//!           └── one atomic update: next_run_at, status, last_error, lease
//! ```

pub mod engine;
pub mod source;
pub mod store;

pub use engine::{SchedulerEngine, SchedulerHandle};
pub use source::SqliteDatasetSource;
pub use store::{JobUpdate, ScheduleStore};
