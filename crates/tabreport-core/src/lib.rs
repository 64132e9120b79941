//! # TabReport Core
//!
//! Shared building blocks for the report scheduling workspace:
//! the `ScheduleJob` data model, the tabular `Dataset` handed over by the
//! data-extraction collaborator, the error taxonomy, configuration, and the
//! traits the scheduler uses to reach its collaborators.

pub mod cadence;
pub mod config;
pub mod dataset;
pub mod error;
pub mod job;
pub mod traits;

pub use cadence::{MonthDay, Recurrence};
pub use config::ReportConfig;
pub use dataset::{Cell, Dataset};
pub use error::{ReportError, Result};
pub use job::{
    ChannelKind, FileFormat, FormatOptions, Frequency, JobDraft, JobStatus, Orientation,
    PaperSize, Recipient, RunOutcome, RunRecord, ScheduleJob,
};
pub use traits::DataSource;
