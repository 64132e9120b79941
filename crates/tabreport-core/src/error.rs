//! Error taxonomy shared by every TabReport crate.

use thiserror::Error;

/// Errors raised while creating, storing, running or delivering report jobs.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Bad input at job creation, or a stored row that violates the job invariants.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Schedule job not found: {0}")]
    NotFound(String),

    /// The data-extraction collaborator could not produce a dataset.
    #[error("Data fetch failed: {0}")]
    DataFetch(String),

    /// The chosen format cannot represent the dataset.
    #[error("Render failed: {0}")]
    Render(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Per-recipient delivery failure (SMTP, WhatsApp API, artifact upload).
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// This worker no longer holds the run lease on the job.
    #[error("Lease lost on job {0}")]
    LeaseLost(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReportError {
    /// True for errors caused by the caller's input rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::UnsupportedFormat(_))
    }
}

pub type Result<T> = std::result::Result<T, ReportError>;
