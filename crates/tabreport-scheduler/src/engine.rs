//! Scheduler engine: the loop that finds due jobs and runs them.
//!
//! Each tick lists due jobs, takes a free run slot and then the lease on
//! each, and spawns the run pipeline (fetch → render → deliver →
//! reschedule) on its own task. The tick never waits for runs. A job is
//! claimed only when a slot is free, so a claimed lease is never left
//! waiting behind other runs, and the lease is renewed while the run lasts.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tabreport_channels::{ArtifactStore, ChannelSet, ReportMessage, Transport};
use tabreport_core::config::SchedulerConfig;
use tabreport_core::{
    DataSource, JobStatus, ReportError, Result, RunOutcome, RunRecord, ScheduleJob,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::store::ScheduleStore;

type RunningSet = Arc<Mutex<HashSet<String>>>;

pub struct SchedulerEngine {
    store: Arc<ScheduleStore>,
    source: Arc<dyn DataSource>,
    channels: ChannelSet,
    config: SchedulerConfig,
    worker_id: String,
    permits: Arc<Semaphore>,
    /// Ids of jobs this process is running right now.
    running: RunningSet,
    artifacts: Option<ArtifactStore>,
}

/// A job this worker holds the lease on, together with its run slot.
struct Claimed {
    job: ScheduleJob,
    _permit: OwnedSemaphorePermit,
    _running: RunningGuard,
}

/// Marks a job as running in this process until dropped.
struct RunningGuard {
    set: RunningSet,
    id: String,
}

impl RunningGuard {
    /// `None` if the job is already running here.
    fn enter(set: &RunningSet, id: &str) -> Option<Self> {
        let mut ids = set.lock().ok()?;
        if !ids.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            id: id.to_string(),
        })
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Ok(mut ids) = self.set.lock() {
            ids.remove(&self.id);
        }
    }
}

impl SchedulerEngine {
    pub fn new(
        store: Arc<ScheduleStore>,
        source: Arc<dyn DataSource>,
        channels: ChannelSet,
        config: SchedulerConfig,
    ) -> Self {
        let worker_id = config.resolved_worker_id();
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            store,
            source,
            channels,
            config,
            worker_id,
            permits,
            running: Arc::default(),
            artifacts: None,
        }
    }

    /// Sweep expired report links from `artifacts` on every tick.
    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.store
    }

    fn lease(&self) -> Duration {
        Duration::seconds(self.config.lease_secs.max(1) as i64)
    }

    /// Start the periodic loop on a background task.
    ///
    /// Leases left behind by a previous run of this worker are released first.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        match self.store.release_all_for(&self.worker_id) {
            Ok(0) => {}
            Ok(n) => tracing::info!("🔓 Released {n} stale lease(s) held by {}", self.worker_id),
            Err(e) => tracing::warn!("⚠️ Could not release stale leases: {e}"),
        }
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(self.run_loop(rx));
        SchedulerHandle { shutdown, task }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ Scheduler started (worker {}, check every {}s, {} concurrent run(s))",
            self.worker_id,
            self.config.tick_secs,
            self.config.max_concurrent_runs
        );
        let mut interval =
            tokio::time::interval(StdDuration::from_secs(self.config.tick_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut runs = JoinSet::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    while let Some(done) = runs.try_join_next() {
                        if let Err(e) = done {
                            tracing::warn!("⚠️ Run task ended abnormally: {e}");
                        }
                    }
                    let now = Utc::now();
                    match self.claim_due(now, &HashSet::new()) {
                        Ok(claimed) => {
                            for run in claimed {
                                let engine = self.clone();
                                runs.spawn(async move {
                                    let id = run.job.id.clone();
                                    if let Err(e) = engine.execute(run, now).await {
                                        tracing::error!("❌ Run of {id} could not be recorded: {e}");
                                    }
                                });
                            }
                        }
                        Err(e) => tracing::error!("❌ Scheduler tick failed: {e}"),
                    }
                    if let Some(artifacts) = &self.artifacts
                        && let Err(e) = artifacts.sweep_expired(now).await
                    {
                        tracing::warn!("⚠️ Report link cleanup failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("🛑 Scheduler stopping, {} run(s) in flight", runs.len());
        let grace = StdDuration::from_secs(self.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while runs.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "⚠️ Grace period elapsed, aborting {} run(s); their leases expire on their own",
                runs.len()
            );
            runs.abort_all();
            while runs.join_next().await.is_some() {}
        }
        tracing::info!("⏹️ Scheduler stopped");
    }

    /// Run every due job now and wait for all of them.
    ///
    /// Jobs beyond the concurrency limit run in later batches of the same
    /// call. A job is attempted at most once per call.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<Vec<RunRecord>> {
        let mut attempted = HashSet::new();
        let mut records = Vec::new();
        loop {
            let batch = self.claim_due(now, &attempted)?;
            if batch.is_empty() {
                break;
            }
            tracing::info!("🔔 {} job(s) due", batch.len());
            attempted.extend(batch.iter().map(|c| c.job.id.clone()));
            let results =
                futures::future::join_all(batch.into_iter().map(|run| self.execute(run, now)))
                    .await;
            for result in results {
                match result {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::error!("❌ Run could not be recorded: {e}"),
                }
            }
        }
        Ok(records)
    }

    /// Claim due jobs while run slots are free. Jobs in `skip`, or already
    /// running in this process, are left alone.
    fn claim_due(&self, now: DateTime<Utc>, skip: &HashSet<String>) -> Result<Vec<Claimed>> {
        let mut claimed = Vec::new();
        for job in self.store.list_due(now)? {
            if skip.contains(&job.id) {
                continue;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                tracing::debug!("All run slots busy, leaving remaining jobs for the next tick");
                break;
            };
            let Some(running) = RunningGuard::enter(&self.running, &job.id) else {
                tracing::debug!("Job {} is already running on this worker", job.id);
                continue;
            };
            match self.store.try_claim(&job.id, &self.worker_id, now, self.lease()) {
                Ok(true) => claimed.push(Claimed {
                    job,
                    _permit: permit,
                    _running: running,
                }),
                Ok(false) => tracing::debug!("Job {} is leased by another worker", job.id),
                Err(e) => tracing::warn!("⚠️ Could not claim {}: {e}", job.id),
            }
        }
        Ok(claimed)
    }

    /// Run one claimed job, renewing its lease until the run finishes.
    ///
    /// If the lease is lost the run stops and nothing is written back.
    async fn execute(&self, claimed: Claimed, now: DateTime<Utc>) -> Result<RunRecord> {
        let job = &claimed.job;
        let pipeline = self.run_pipeline(job, now);
        tokio::pin!(pipeline);

        let period = StdDuration::from_millis((self.config.lease_secs.max(1) * 1000 / 3).max(100));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let clock = tokio::time::Instant::now();
        loop {
            tokio::select! {
                record = &mut pipeline => return record,
                _ = renew.tick() => {
                    let elapsed = Duration::from_std(clock.elapsed()).unwrap_or_else(|_| Duration::zero());
                    match self.store.renew(&job.id, &self.worker_id, now + elapsed + self.lease()) {
                        Ok(true) => tracing::debug!("Renewed lease on {}", job.id),
                        Ok(false) => {
                            tracing::warn!(
                                "⚠️ Lost the lease on '{}' mid-run, abandoning it",
                                job.name
                            );
                            return Err(ReportError::LeaseLost(job.id.clone()));
                        }
                        Err(e) => tracing::warn!("⚠️ Could not renew lease on {}: {e}", job.id),
                    }
                }
            }
        }
    }

    /// Fetch, render, deliver and write back the outcome.
    async fn run_pipeline(&self, job: &ScheduleJob, now: DateTime<Utc>) -> Result<RunRecord> {
        let started_at = Utc::now();
        tracing::info!("▶️ Running '{}' ({})", job.name, job.id);

        let report = match self.produce(job, now).await {
            Ok(report) => report,
            Err(e) => {
                return self.finish_failed(job, now, started_at, e.to_string(), Vec::new());
            }
        };

        let results = self.channels.deliver(&report, &job.recipients).await;
        let delivered: usize = results.iter().map(|r| r.delivered.len()).sum();
        let warnings: Vec<String> = results
            .iter()
            .flat_map(|r| {
                r.failed
                    .iter()
                    .map(move |(target, reason)| format!("{}:{target}: {reason}", r.channel))
            })
            .collect();
        for r in &results {
            if let Transport::Link(url) = &r.transport {
                tracing::info!("🔗 {} recipients of '{}' got a link: {url}", r.channel, job.name);
            }
        }

        if delivered == 0 {
            let error = format!(
                "all {} recipient(s) failed: {}",
                warnings.len(),
                warnings.join("; ")
            );
            return self.finish_failed(job, now, started_at, error, warnings);
        }
        self.finish_delivered(job, now, started_at, delivered, warnings)
    }

    /// Fetch and render, producing the message to deliver.
    async fn produce(&self, job: &ScheduleJob, now: DateTime<Utc>) -> Result<ReportMessage> {
        let dataset = self.source.fetch(&job.data_source).await?;
        let format = job.format.clone();
        let file_format = format.file_format;
        let rows = dataset.row_count();
        let rendered =
            tokio::task::spawn_blocking(move || tabreport_render::render(&dataset, &format))
                .await
                .map_err(|e| ReportError::Render(format!("render task failed: {e}")))??;

        let content_type = rendered.content_type().to_string();
        let body = format!(
            "{}\n\nDataset: {}\nRows: {rows}\nFormat: {}\nGenerated: {}",
            job.message_body(),
            job.data_source,
            file_format.as_str(),
            now.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(ReportMessage {
            payload: rendered.bytes,
            filename: tabreport_render::report_filename(&job.data_source, file_format, now),
            content_type,
            subject: job.subject_line(),
            body,
        })
    }

    fn finish_failed(
        &self,
        job: &ScheduleJob,
        now: DateTime<Utc>,
        started_at: DateTime<Utc>,
        error: String,
        warnings: Vec<String>,
    ) -> Result<RunRecord> {
        tracing::warn!("❌ Schedule '{}' failed: {error}", job.name);
        let message = error.clone();
        self.commit(job, move |j| {
            // A job paused mid-run stays paused.
            if j.status == JobStatus::Active {
                j.status = JobStatus::Failed;
            }
            j.last_run_at = Some(now);
            j.last_error = Some(message);
        })?;
        self.record(RunRecord {
            job_id: job.id.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome: RunOutcome::Failed,
            delivered: 0,
            warnings,
            error: Some(error),
        })
    }

    fn finish_delivered(
        &self,
        job: &ScheduleJob,
        now: DateTime<Utc>,
        started_at: DateTime<Utc>,
        delivered: usize,
        warnings: Vec<String>,
    ) -> Result<RunRecord> {
        let outcome = if warnings.is_empty() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Partial
        };
        let updated = self.commit(job, |j| {
            let previous = j.next_run_at.unwrap_or(j.start_at);
            match j.next_run_after(previous, now) {
                Some((next, skipped)) => {
                    if skipped > 0 {
                        tracing::info!(
                            "⏭️ '{}' skipped {skipped} missed run(s), next at {next}",
                            j.name
                        );
                    }
                    j.next_run_at = Some(next);
                }
                None => {
                    j.next_run_at = None;
                    j.status = JobStatus::Completed;
                }
            }
            j.last_run_at = Some(now);
            j.last_error = None;
        })?;
        tracing::info!(
            "✅ '{}' delivered to {delivered} recipient(s){}; next run: {}",
            job.name,
            if warnings.is_empty() {
                String::new()
            } else {
                format!(", {} failed", warnings.len())
            },
            updated
                .next_run_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "none (completed)".into())
        );
        self.record(RunRecord {
            job_id: job.id.clone(),
            started_at,
            finished_at: Utc::now(),
            outcome,
            delivered,
            warnings,
            error: None,
        })
    }

    /// Final atomic update of a run: apply `change` and drop the lease.
    ///
    /// Refused with [`ReportError::LeaseLost`] when another worker has taken
    /// the lease in the meantime.
    fn commit<F>(&self, job: &ScheduleJob, change: F) -> Result<ScheduleJob>
    where
        F: FnOnce(&mut ScheduleJob),
    {
        let result = self.store.modify(&job.id, |j| {
            if j.lease_owner.as_deref() != Some(self.worker_id.as_str()) {
                return Err(ReportError::LeaseLost(j.id.clone()));
            }
            change(j);
            j.lease_owner = None;
            j.lease_expires_at = None;
            Ok(())
        });
        match &result {
            Ok(_) => {}
            Err(ReportError::LeaseLost(_)) => {
                tracing::warn!(
                    "⚠️ '{}' was taken over by another worker, result not written",
                    job.name
                );
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not update '{}' after run: {e}", job.name);
                if let Err(e) = self.store.release(&job.id, &self.worker_id) {
                    tracing::warn!("⚠️ Could not release lease on {}: {e}", job.id);
                }
            }
        }
        result
    }

    fn record(&self, run: RunRecord) -> Result<RunRecord> {
        if let Err(e) = self.store.record_run(&run) {
            tracing::warn!("⚠️ Could not store run record for {}: {e}", run.job_id);
        }
        Ok(run)
    }
}

/// Running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop ticking, wait for in-flight runs up to the grace period, then abort the rest.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("⚠️ Scheduler task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rusqlite::params;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tabreport_channels::{DeliveryResult, ReportChannel};
    use tabreport_core::{
        Cell, ChannelKind, Dataset, FileFormat, FormatOptions, Frequency, JobDraft, Recipient,
        Recurrence,
    };

    #[derive(Default)]
    struct FakeSource {
        fail: bool,
        delay: Option<StdDuration>,
        started: AtomicBool,
        /// Hand every lease to "other-worker" during the fetch.
        steal_from: Option<Arc<ScheduleStore>>,
    }

    #[async_trait]
    impl DataSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn fetch(&self, source_ref: &str) -> Result<Dataset> {
            self.started.store(true, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(store) = &self.steal_from {
                for job in store.list()? {
                    store.release(&job.id, "test-worker")?;
                    store.try_claim(&job.id, "other-worker", Utc::now(), Duration::minutes(15))?;
                }
            }
            if self.fail {
                return Err(ReportError::DataFetch("Tableau session expired".into()));
            }
            let mut ds = Dataset::new(source_ref, vec!["region".into(), "amount".into()]);
            ds.push_row(vec!["north".into(), Cell::Int(10)]);
            Ok(ds)
        }
    }

    /// Email channel that rejects a fixed set of addresses and records the rest.
    #[derive(Default)]
    struct FakeEmail {
        reject: HashSet<String>,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ReportChannel for FakeEmail {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Email
        }

        async fn send(&self, report: &ReportMessage, recipients: &[String]) -> DeliveryResult {
            let mut result = DeliveryResult::new(ChannelKind::Email, Transport::Attachment);
            for to in recipients {
                if self.reject.contains(to) {
                    result.failed.push((to.clone(), "550 mailbox unavailable".into()));
                } else {
                    self.sent
                        .lock()
                        .unwrap()
                        .push((to.clone(), report.filename.clone()));
                    result.delivered.push(to.clone());
                }
            }
            result
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn draft(frequency: Frequency, recipients: Vec<Recipient>) -> JobDraft {
        JobDraft {
            name: "Daily sales".into(),
            owner: "u-1".into(),
            data_source: Some("sales".into()),
            frequency,
            start_at: Some(t0()),
            recurrence: Recurrence::default(),
            format: FormatOptions {
                file_format: FileFormat::Csv,
                ..Default::default()
            },
            recipients,
            subject: None,
            message: None,
        }
    }

    struct Harness {
        engine: SchedulerEngine,
        email: Arc<FakeEmail>,
        source: Arc<FakeSource>,
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            worker_id: "test-worker".into(),
            ..Default::default()
        }
    }

    fn harness(fail_fetch: bool, reject: &[&str]) -> Harness {
        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let source = FakeSource {
            fail: fail_fetch,
            ..Default::default()
        };
        harness_with(store, source, test_config(), reject)
    }

    fn harness_with(
        store: Arc<ScheduleStore>,
        source: FakeSource,
        config: SchedulerConfig,
        reject: &[&str],
    ) -> Harness {
        let email = Arc::new(FakeEmail {
            reject: reject.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
        let source = Arc::new(source);
        let channels = ChannelSet::new().with(email.clone());
        let engine = SchedulerEngine::new(store, source.clone(), channels, config);
        Harness {
            engine,
            email,
            source,
        }
    }

    fn add(h: &Harness, draft: JobDraft) -> ScheduleJob {
        let job = ScheduleJob::new(draft, t0()).unwrap();
        h.engine.store().create(&job).unwrap();
        job
    }

    async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let reached = tokio::time::timeout(StdDuration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(StdDuration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_successful_run_advances_schedule() {
        let h = harness(false, &[]);
        let job = add(
            &h,
            draft(Frequency::Daily, vec![Recipient::email("ops@example.com")]),
        );
        let now = t0() + Duration::minutes(1);

        let runs = h.engine.run_due(now).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
        assert_eq!(runs[0].delivered, 1);

        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.next_run_at, Some(t0() + Duration::days(1)));
        assert_eq!(stored.last_run_at, Some(now));
        assert!(stored.lease_owner.is_none());

        let sent = h.email.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("ops@example.com".to_string(), "sales_20260301_080100.csv".to_string())]);
        assert_eq!(h.engine.store().runs_for(&job.id, 5).unwrap().len(), 1);

        // Not due again until tomorrow.
        assert!(h.engine.run_due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_next_run() {
        let h = harness(true, &[]);
        let job = add(
            &h,
            draft(Frequency::Weekly, vec![Recipient::email("ops@example.com")]),
        );
        let runs = h.engine.run_due(t0()).await.unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Failed);

        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.next_run_at, Some(t0()));
        assert!(stored.last_error.unwrap().contains("session expired"));
        assert!(h.email.sent.lock().unwrap().is_empty());

        // Failed jobs are not retried automatically.
        assert!(h.engine.run_due(t0() + Duration::hours(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_delivery_stays_active() {
        let h = harness(false, &["bad@example.com"]);
        let job = add(
            &h,
            draft(
                Frequency::Daily,
                vec![
                    Recipient::email("ops@example.com"),
                    Recipient::email("bad@example.com"),
                ],
            ),
        );
        let runs = h.engine.run_due(t0()).await.unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Partial);
        assert_eq!(runs[0].delivered, 1);
        assert_eq!(runs[0].warnings.len(), 1);
        assert!(runs[0].warnings[0].starts_with("email:bad@example.com"));

        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.next_run_at, Some(t0() + Duration::days(1)));
    }

    #[tokio::test]
    async fn test_all_recipients_failing_fails_job() {
        let h = harness(false, &[]);
        // No WhatsApp channel is configured.
        let job = add(
            &h,
            draft(Frequency::Daily, vec![Recipient::whatsapp("+15550001111")]),
        );
        let runs = h.engine.run_due(t0()).await.unwrap();
        assert_eq!(runs[0].outcome, RunOutcome::Failed);

        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.next_run_at, Some(t0()));
        assert!(stored.last_error.unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn test_one_time_job_completes() {
        let h = harness(false, &[]);
        let job = add(
            &h,
            draft(Frequency::OneTime, vec![Recipient::email("ops@example.com")]),
        );
        h.engine.run_due(t0()).await.unwrap();

        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.next_run_at.is_none());
        assert!(h.engine.run_due(t0() + Duration::days(30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missed_runs_are_skipped() {
        let h = harness(false, &[]);
        let job = add(
            &h,
            draft(Frequency::Daily, vec![Recipient::email("ops@example.com")]),
        );
        let now = t0() + Duration::hours(84);
        let runs = h.engine.run_due(now).await.unwrap();
        assert_eq!(runs.len(), 1);

        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.next_run_at, Some(t0() + Duration::days(4)));
        assert_eq!(h.email.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_weekly_job_on_selected_days_reschedules_to_next_day() {
        let h = harness(false, &[]);
        // t0 is a Sunday: the first run is Monday, then Thursday.
        let job = add(
            &h,
            JobDraft {
                recurrence: Recurrence {
                    weekdays: vec![chrono::Weekday::Mon, chrono::Weekday::Thu],
                    month_day: None,
                },
                ..draft(Frequency::Weekly, vec![Recipient::email("ops@example.com")])
            },
        );
        assert_eq!(job.next_run_at, Some(t0() + Duration::days(1)));
        assert!(h.engine.run_due(t0()).await.unwrap().is_empty());

        let monday = t0() + Duration::days(1);
        assert_eq!(h.engine.run_due(monday).await.unwrap().len(), 1);
        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.next_run_at, Some(t0() + Duration::days(4)));
    }

    #[tokio::test]
    async fn test_leased_job_is_not_run_twice() {
        let h = harness(false, &[]);
        let job = add(
            &h,
            draft(Frequency::Daily, vec![Recipient::email("ops@example.com")]),
        );
        assert!(
            h.engine
                .store()
                .try_claim(&job.id, "other-worker", t0(), Duration::minutes(15))
                .unwrap()
        );
        assert!(h.engine.run_due(t0()).await.unwrap().is_empty());
        assert!(h.email.sent.lock().unwrap().is_empty());

        // After the other worker's lease expires the job is picked up.
        let runs = h.engine.run_due(t0() + Duration::minutes(16)).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_job_does_not_block_other_runs() {
        let h = harness(false, &[]);
        let bad = add(
            &h,
            draft(Frequency::Daily, vec![Recipient::email("legacy@example.com")]),
        );
        let good = add(
            &h,
            draft(Frequency::Daily, vec![Recipient::email("ops@example.com")]),
        );
        h.engine
            .store()
            .lock()
            .unwrap()
            .execute(
                "UPDATE schedule_jobs SET recipients = ?2 WHERE id = ?1",
                params![bad.id, r#"[{"channel":"fax","target":"555"}]"#],
            )
            .unwrap();

        let runs = h.engine.run_due(t0()).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, good.id);
        let sent = h.email.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ops@example.com");
        assert_eq!(
            h.engine.store().get(&good.id).unwrap().next_run_at,
            Some(t0() + Duration::days(1))
        );
        // The unreadable row is not offered again.
        assert!(h.engine.run_due(t0()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_ticks_run_a_slow_job_once() {
        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let source = FakeSource {
            delay: Some(StdDuration::from_millis(600)),
            ..Default::default()
        };
        let config = SchedulerConfig {
            lease_secs: 1,
            ..test_config()
        };
        let h = harness_with(store, source, config, &[]);
        let job = add(
            &h,
            draft(Frequency::Daily, vec![Recipient::email("ops@example.com")]),
        );

        // The second tick comes after the first run's original lease window.
        let first = h.engine.run_due(t0());
        let second = async {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            h.engine.run_due(t0() + Duration::seconds(2)).await
        };
        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap().len(), 1);
        assert!(second.unwrap().is_empty());

        assert_eq!(h.email.sent.lock().unwrap().len(), 1);
        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.next_run_at, Some(t0() + Duration::days(1)));
        assert!(stored.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_claims_only_as_many_jobs_as_free_slots() {
        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let config = SchedulerConfig {
            max_concurrent_runs: 1,
            ..test_config()
        };
        let h = harness_with(store, FakeSource::default(), config, &[]);
        let a = add(&h, draft(Frequency::Daily, vec![Recipient::email("a@example.com")]));
        let b = add(&h, draft(Frequency::Daily, vec![Recipient::email("b@example.com")]));

        let claimed = h.engine.claim_due(t0(), &HashSet::new()).unwrap();
        assert_eq!(claimed.len(), 1);
        let waiting = if claimed[0].job.id == a.id { &b } else { &a };
        assert!(h.engine.store().get(&waiting.id).unwrap().lease_owner.is_none());
        // Hand the claimed lease back; dropping the claim frees its slot.
        for run in claimed {
            h.engine.store().release(&run.job.id, "test-worker").unwrap();
        }

        // A full pass still reaches both, one after the other.
        let runs = h.engine.run_due(t0()).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(h.email.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_result_not_written_after_lease_taken_over() {
        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let source = FakeSource {
            steal_from: Some(store.clone()),
            ..Default::default()
        };
        let h = harness_with(store, source, test_config(), &[]);
        let job = add(
            &h,
            draft(Frequency::Daily, vec![Recipient::email("ops@example.com")]),
        );

        assert!(h.engine.run_due(t0()).await.unwrap().is_empty());
        let stored = h.engine.store().get(&job.id).unwrap();
        assert_eq!(stored.next_run_at, Some(t0()));
        assert!(stored.last_run_at.is_none());
        assert_eq!(stored.lease_owner.as_deref(), Some("other-worker"));
        assert!(h.engine.store().runs_for(&job.id, 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let h = harness(false, &[]);
        let now = Utc::now();
        let job = ScheduleJob::new(
            JobDraft {
                start_at: None,
                ..draft(Frequency::Daily, vec![Recipient::email("ops@example.com")])
            },
            now,
        )
        .unwrap();
        h.engine.store().create(&job).unwrap();

        let email = h.email.clone();
        let engine = Arc::new(h.engine);
        let handle = engine.clone().start();
        assert!(handle.is_running());

        wait_until("the loop to run the job", || !email.sent.lock().unwrap().is_empty()).await;

        handle.stop().await;
        let stored = engine.store().get(&job.id).unwrap();
        assert!(stored.next_run_at.unwrap() > now);
    }

    #[tokio::test]
    async fn test_stop_aborts_slow_run_and_restart_frees_its_lease() {
        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let config = SchedulerConfig {
            tick_secs: 1,
            shutdown_grace_secs: 0,
            ..test_config()
        };
        let source = FakeSource {
            delay: Some(StdDuration::from_secs(30)),
            ..Default::default()
        };
        let h = harness_with(store.clone(), source, config.clone(), &[]);
        let job = ScheduleJob::new(
            JobDraft {
                start_at: None,
                ..draft(Frequency::Daily, vec![Recipient::email("ops@example.com")])
            },
            Utc::now(),
        )
        .unwrap();
        store.create(&job).unwrap();

        let source = h.source.clone();
        let handle = Arc::new(h.engine).start();
        wait_until("the fetch to start", || source.started.load(Ordering::SeqCst)).await;
        handle.stop().await;

        // The aborted run wrote nothing back and still holds its lease.
        let stored = store.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(stored.next_run_at, job.next_run_at);
        assert!(stored.last_run_at.is_none());
        assert_eq!(stored.lease_owner.as_deref(), Some("test-worker"));
        assert!(h.email.sent.lock().unwrap().is_empty());

        // The same worker coming back up drops the stale lease before its first tick.
        let restarted = harness_with(store.clone(), FakeSource::default(), config, &[]);
        let handle = Arc::new(restarted.engine).start();
        assert!(store.get(&job.id).unwrap().lease_owner.is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_loop_sweeps_expired_report_links() {
        let dir = tempfile::tempdir().unwrap();
        let reports = dir.path().join("reports");
        std::fs::create_dir_all(&reports).unwrap();
        std::fs::write(reports.join("abc_old.pdf"), b"%PDF").unwrap();
        std::fs::write(
            reports.join("abc_old.pdf.json"),
            r#"{"file":"abc_old.pdf","created_at":"2026-01-01T00:00:00Z","expires_at":"2026-01-02T00:00:00Z"}"#,
        )
        .unwrap();

        let store = Arc::new(ScheduleStore::open_in_memory().unwrap());
        let h = harness_with(store, FakeSource::default(), test_config(), &[]);
        let artifacts = ArtifactStore::new(&reports, "http://localhost:8501", Duration::hours(24));
        let handle = Arc::new(h.engine.with_artifacts(artifacts)).start();

        let old = reports.join("abc_old.pdf");
        wait_until("the expired report to be removed", || !old.exists()).await;
        assert!(!reports.join("abc_old.pdf.json").exists());
        handle.stop().await;
    }
}
