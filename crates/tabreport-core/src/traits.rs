//! Collaborator interfaces the scheduler depends on.

use async_trait::async_trait;

use crate::dataset::Dataset;
use crate::error::Result;

/// Data-extraction collaborator (the Tableau downloader).
///
/// Implementations return `ReportError::DataFetch` when the source is
/// unreachable, authentication has expired, or the dataset is empty.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Fetch a fresh copy of the dataset named by `source_ref`.
    async fn fetch(&self, source_ref: &str) -> Result<Dataset>;
}
