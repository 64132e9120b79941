//! Publishes report files where the gateway serves them (`/reports/<file>`).
//!
//! Each published file gets an unguessable token prefix and a `<file>.json`
//! sidecar recording when the link expires. [`ArtifactStore::sweep_expired`]
//! removes expired files together with their sidecars.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tabreport_core::config::{ArtifactsConfig, expand_path};
use tabreport_core::{ReportError, Result};

const META_SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    base_url: String,
    ttl: Duration,
}

/// Sidecar written next to every published file.
#[derive(Debug, Serialize, Deserialize)]
struct ArtifactMeta {
    file: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: &str, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
        }
    }

    pub fn from_config(config: &ArtifactsConfig) -> Self {
        Self::new(
            expand_path(&config.dir),
            &config.base_url,
            Duration::hours(config.link_ttl_hours.max(1) as i64),
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Public URL for a published file.
    pub fn url_for(&self, filename: &str) -> String {
        format!("{}/reports/{}", self.base_url, filename)
    }

    /// Write the file under a fresh token name and return its URL.
    pub async fn publish(&self, filename: &str, bytes: &[u8]) -> Result<String> {
        self.publish_at(filename, bytes, Utc::now()).await
    }

    async fn publish_at(&self, filename: &str, bytes: &[u8], now: DateTime<Utc>) -> Result<String> {
        if filename.is_empty()
            || filename.contains(['/', '\\'])
            || filename.starts_with('.')
        {
            return Err(ReportError::Channel(format!(
                "refusing to publish '{filename}'"
            )));
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        let stored = format!("{token}_{filename}");
        let meta = ArtifactMeta {
            file: stored.clone(),
            created_at: now,
            expires_at: now + self.ttl,
        };
        let meta_json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| ReportError::Channel(format!("artifact metadata: {e}")))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(&stored), bytes).await?;
        tokio::fs::write(self.dir.join(format!("{stored}{META_SUFFIX}")), meta_json).await?;

        let url = self.url_for(&stored);
        tracing::info!(
            "🔗 Published {filename} ({} bytes) until {}",
            bytes.len(),
            meta.expires_at.format("%Y-%m-%d %H:%M UTC")
        );
        Ok(url)
    }

    /// Delete every published file whose link expired at or before `now`.
    /// Returns how many files were removed.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(META_SUFFIX) {
                continue;
            }
            let meta: ArtifactMeta = match tokio::fs::read(entry.path())
                .await
                .ok()
                .and_then(|raw| serde_json::from_slice(&raw).ok())
            {
                Some(meta) => meta,
                None => {
                    tracing::warn!("⚠️ Unreadable artifact metadata {name}, leaving it");
                    continue;
                }
            };
            if meta.expires_at > now {
                continue;
            }
            // The sidecar names the file; refuse anything that would leave the directory.
            if meta.file.contains(['/', '\\']) || meta.file.starts_with('.') {
                tracing::warn!("⚠️ Artifact metadata {name} points outside the reports directory");
                continue;
            }
            match tokio::fs::remove_file(self.dir.join(&meta.file)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("⚠️ Could not remove expired report {}: {e}", meta.file);
                    continue;
                }
            }
            tokio::fs::remove_file(entry.path()).await?;
        }
        if removed > 0 {
            tracing::info!("🧹 Removed {removed} expired report link(s)");
        }
        Ok(removed)
    }
}
