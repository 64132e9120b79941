//! SQLite-backed Schedule Store.
//!
//! One connection behind a mutex. Every mutation of an existing job goes
//! through [`ScheduleStore::modify`], which reads, changes, re-validates and
//! writes the row inside one immediate transaction.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tabreport_core::{
    FormatOptions, Frequency, JobStatus, Recipient, Recurrence, ReportError, Result, RunOutcome,
    RunRecord, ScheduleJob,
};

const JOB_COLUMNS: &str = "id, name, owner, data_source, frequency, start_at, next_run_at, \
     last_run_at, format_options, recipients, subject, message, status, last_error, \
     lease_owner, lease_expires_at, created_at, updated_at, recurrence";

/// A partial set of job fields applied by [`ScheduleStore::update`].
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    /// `Some(None)` clears the next run.
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// `Some(None)` clears the error.
    pub last_error: Option<Option<String>>,
    pub release_lease: bool,
}

impl JobUpdate {
    pub fn apply(self, job: &mut ScheduleJob) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(next) = self.next_run_at {
            job.next_run_at = next;
        }
        if let Some(last) = self.last_run_at {
            job.last_run_at = Some(last);
        }
        if let Some(error) = self.last_error {
            job.last_error = error;
        }
        if self.release_lease {
            job.lease_owner = None;
            job.lease_expires_at = None;
        }
    }
}

pub struct ScheduleStore {
    conn: Mutex<Connection>,
}

impl ScheduleStore {
    /// Open or create the schedule database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| storage("DB open", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| storage("DB pragma", e))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| storage("DB open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS schedule_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner TEXT NOT NULL,
                data_source TEXT NOT NULL,
                frequency TEXT NOT NULL,         -- 'one-time', 'daily', 'weekly', 'monthly'
                start_at TEXT NOT NULL,
                next_run_at TEXT,                -- NULL only for completed jobs
                last_run_at TEXT,
                format_options TEXT NOT NULL,    -- JSON
                recipients TEXT NOT NULL,        -- JSON array of {channel, target}
                subject TEXT,
                message TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                last_error TEXT,
                lease_owner TEXT,
                lease_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                recurrence TEXT NOT NULL DEFAULT '{}'  -- JSON {weekdays, month_day}
            );
            CREATE INDEX IF NOT EXISTS idx_schedule_jobs_due
                ON schedule_jobs(status, next_run_at);

            CREATE TABLE IF NOT EXISTS schedule_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                outcome TEXT NOT NULL,           -- 'succeeded', 'partial', 'failed'
                delivered INTEGER NOT NULL DEFAULT 0,
                warnings TEXT NOT NULL DEFAULT '[]',
                error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_schedule_runs_job ON schedule_runs(job_id, id);
            ",
            )
            .map_err(|e| storage("Migration", e))?;
        self.add_column_if_missing("recurrence", "TEXT NOT NULL DEFAULT '{}'")
    }

    /// Databases created before a column existed get it added in place.
    fn add_column_if_missing(&self, column: &str, definition: &str) -> Result<()> {
        let conn = self.lock()?;
        let present: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('schedule_jobs') WHERE name = ?1",
                params![column],
                |row| row.get(0),
            )
            .map_err(|e| storage("Migration", e))?;
        if present == 0 {
            conn.execute_batch(&format!(
                "ALTER TABLE schedule_jobs ADD COLUMN {column} {definition}"
            ))
            .map_err(|e| storage("Migration", e))?;
            tracing::info!("🗄️ Added column schedule_jobs.{column}");
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ReportError::Storage("schedule store lock poisoned".into()))
    }

    // ─── Jobs ─────────────────────────────────────────────────

    /// Persist a new job. Invalid jobs never reach the database.
    pub fn create(&self, job: &ScheduleJob) -> Result<String> {
        job.validate()?;
        let conn = self.lock()?;
        let v = JobValues::encode(job)?;
        conn.execute(
            &format!(
                "INSERT INTO schedule_jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
            ),
            params![
                v.id, v.name, v.owner, v.data_source, v.frequency, v.start_at, v.next_run_at,
                v.last_run_at, v.format_options, v.recipients, v.subject, v.message, v.status,
                v.last_error, v.lease_owner, v.lease_expires_at, v.created_at, v.updated_at,
                v.recurrence
            ],
        )
        .map_err(|e| storage("Insert job", e))?;
        tracing::info!("📅 Schedule created: '{}' ({})", job.name, job.id);
        Ok(job.id.clone())
    }

    pub fn get(&self, id: &str) -> Result<ScheduleJob> {
        let conn = self.lock()?;
        get_job(&conn, id)
    }

    /// All readable jobs, oldest first. Rows that no longer decode are skipped.
    pub fn list(&self) -> Result<Vec<ScheduleJob>> {
        let conn = self.lock()?;
        let (jobs, _unreadable) = query_jobs(
            &conn,
            &format!("SELECT {JOB_COLUMNS} FROM schedule_jobs ORDER BY created_at, id"),
            params![],
        )?;
        Ok(jobs)
    }

    /// Active jobs whose next run is at or before `now` and that no worker holds a live lease on.
    ///
    /// A due row that cannot be decoded is marked failed with the decode
    /// error so it stops coming back on every tick.
    pub fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleJob>> {
        let conn = self.lock()?;
        let (jobs, unreadable) = query_jobs(
            &conn,
            &format!(
                "SELECT {JOB_COLUMNS} FROM schedule_jobs
                 WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1
                   AND (lease_expires_at IS NULL OR lease_expires_at <= ?1)
                 ORDER BY next_run_at, id"
            ),
            params![ts(now)],
        )?;
        for (id, e) in unreadable {
            conn.execute(
                "UPDATE schedule_jobs SET status = 'failed', last_error = ?2,
                     lease_owner = NULL, lease_expires_at = NULL, updated_at = ?3
                 WHERE id = ?1",
                params![id, e.to_string(), ts(Utc::now())],
            )
            .map_err(|e| storage("Fail unreadable job", e))?;
        }
        Ok(jobs)
    }

    /// Apply a partial update atomically.
    pub fn update(&self, id: &str, update: JobUpdate) -> Result<ScheduleJob> {
        self.modify(id, |job| {
            update.apply(job);
            Ok(())
        })
    }

    /// Read-modify-write a job inside one immediate transaction.
    ///
    /// The result must still satisfy the job invariants, keep its identity,
    /// and may only move `next_run_at` forward.
    pub fn modify<F>(&self, id: &str, change: F) -> Result<ScheduleJob>
    where
        F: FnOnce(&mut ScheduleJob) -> Result<()>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| storage("Begin", e))?;

        let before = get_job(&tx, id)?;
        let mut job = before.clone();
        change(&mut job)?;

        if job.id != before.id || job.created_at != before.created_at {
            return Err(ReportError::Validation("job identity is immutable".into()));
        }
        if let (Some(old), Some(new)) = (before.next_run_at, job.next_run_at)
            && new < old
        {
            return Err(ReportError::Validation(format!(
                "next run may only move forward ({} → {})",
                ts(old),
                ts(new)
            )));
        }
        job.validate()?;
        job.updated_at = Utc::now().max(before.updated_at);

        let v = JobValues::encode(&job)?;
        tx.execute(
            "UPDATE schedule_jobs SET name = ?2, owner = ?3, data_source = ?4, frequency = ?5,
                 start_at = ?6, next_run_at = ?7, last_run_at = ?8, format_options = ?9,
                 recipients = ?10, subject = ?11, message = ?12, status = ?13, last_error = ?14,
                 lease_owner = ?15, lease_expires_at = ?16, updated_at = ?17, recurrence = ?18
             WHERE id = ?1",
            params![
                v.id, v.name, v.owner, v.data_source, v.frequency, v.start_at, v.next_run_at,
                v.last_run_at, v.format_options, v.recipients, v.subject, v.message, v.status,
                v.last_error, v.lease_owner, v.lease_expires_at, v.updated_at, v.recurrence
            ],
        )
        .map_err(|e| storage("Update job", e))?;
        tx.commit().map_err(|e| storage("Commit", e))?;
        Ok(job)
    }

    /// Delete a job and its run history.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| storage("Begin", e))?;
        let deleted = tx
            .execute("DELETE FROM schedule_jobs WHERE id = ?1", params![id])
            .map_err(|e| storage("Delete job", e))?;
        if deleted == 0 {
            return Err(ReportError::NotFound(id.to_string()));
        }
        tx.execute("DELETE FROM schedule_runs WHERE job_id = ?1", params![id])
            .map_err(|e| storage("Delete runs", e))?;
        tx.commit().map_err(|e| storage("Commit", e))?;
        tracing::info!("🗑️ Schedule deleted: {id}");
        Ok(())
    }

    // ─── Leases ───────────────────────────────────────────────

    /// Take the run lease on an active job. `false` if another lease is
    /// still live, the job is not active, or it does not exist.
    pub fn try_claim(
        &self,
        id: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE schedule_jobs SET lease_owner = ?2, lease_expires_at = ?3
                 WHERE id = ?1 AND status = 'active'
                   AND (lease_expires_at IS NULL OR lease_expires_at <= ?4)",
                params![id, owner, ts(now + lease), ts(now)],
            )
            .map_err(|e| storage("Claim", e))?;
        Ok(changed == 1)
    }

    /// Push the lease expiry out while a run is still going. `false` if
    /// `owner` no longer holds the lease.
    pub fn renew(&self, id: &str, owner: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE schedule_jobs SET lease_expires_at = ?3
                 WHERE id = ?1 AND lease_owner = ?2",
                params![id, owner, ts(expires_at)],
            )
            .map_err(|e| storage("Renew", e))?;
        Ok(changed == 1)
    }

    /// Drop a lease if `owner` still holds it.
    pub fn release(&self, id: &str, owner: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE schedule_jobs SET lease_owner = NULL, lease_expires_at = NULL
             WHERE id = ?1 AND lease_owner = ?2",
            params![id, owner],
        )
        .map_err(|e| storage("Release", e))?;
        Ok(())
    }

    /// Drop every lease held by `owner`; returns how many were released.
    pub fn release_all_for(&self, owner: &str) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE schedule_jobs SET lease_owner = NULL, lease_expires_at = NULL
             WHERE lease_owner = ?1",
            params![owner],
        )
        .map_err(|e| storage("Release all", e))
    }

    // ─── Run history ──────────────────────────────────────────

    pub fn record_run(&self, run: &RunRecord) -> Result<()> {
        let warnings = serde_json::to_string(&run.warnings)
            .map_err(|e| ReportError::Storage(format!("Encode warnings: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO schedule_runs (job_id, started_at, finished_at, outcome, delivered, warnings, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run.job_id,
                ts(run.started_at),
                ts(run.finished_at),
                run.outcome.as_str(),
                run.delivered as i64,
                warnings,
                run.error,
            ],
        )
        .map_err(|e| storage("Insert run", e))?;
        Ok(())
    }

    /// Most recent runs of a job, newest first.
    pub fn runs_for(&self, id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT job_id, started_at, finished_at, outcome, delivered, warnings, error
                 FROM schedule_runs WHERE job_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(|e| storage("Prepare", e))?;
        let raw = stmt
            .query_map(params![id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .map_err(|e| storage("Query runs", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| storage("Read runs", e))?;

        raw.into_iter()
            .map(|(job_id, started, finished, outcome, delivered, warnings, error)| {
                Ok(RunRecord {
                    job_id,
                    started_at: parse_ts(&started)?,
                    finished_at: parse_ts(&finished)?,
                    outcome: outcome.parse::<RunOutcome>()?,
                    delivered: delivered.max(0) as usize,
                    warnings: serde_json::from_str(&warnings).map_err(|e| {
                        ReportError::Validation(format!("stored warnings unreadable: {e}"))
                    })?,
                    error,
                })
            })
            .collect()
    }
}

fn storage(context: &str, e: rusqlite::Error) -> ReportError {
    ReportError::Storage(format!("{context}: {e}"))
}

/// Fixed-width UTC timestamps so text comparison in SQL orders correctly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ReportError::Validation(format!("stored timestamp '{s}' unreadable: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Column values of one job row, as stored.
struct JobValues {
    id: String,
    name: String,
    owner: String,
    data_source: String,
    frequency: String,
    start_at: String,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    format_options: String,
    recipients: String,
    subject: Option<String>,
    message: Option<String>,
    status: String,
    last_error: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    created_at: String,
    updated_at: String,
    recurrence: String,
}

impl JobValues {
    fn encode(job: &ScheduleJob) -> Result<Self> {
        let encode = |e: serde_json::Error| ReportError::Storage(format!("Encode job: {e}"));
        Ok(Self {
            id: job.id.clone(),
            name: job.name.clone(),
            owner: job.owner.clone(),
            data_source: job.data_source.clone(),
            frequency: job.frequency.as_str().to_string(),
            start_at: ts(job.start_at),
            next_run_at: job.next_run_at.map(ts),
            last_run_at: job.last_run_at.map(ts),
            format_options: serde_json::to_string(&job.format).map_err(encode)?,
            recipients: serde_json::to_string(&job.recipients).map_err(encode)?,
            subject: job.subject.clone(),
            message: job.message.clone(),
            status: job.status.as_str().to_string(),
            last_error: job.last_error.clone(),
            lease_owner: job.lease_owner.clone(),
            lease_expires_at: job.lease_expires_at.map(ts),
            created_at: ts(job.created_at),
            updated_at: ts(job.updated_at),
            recurrence: serde_json::to_string(&job.recurrence).map_err(encode)?,
        })
    }

    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            owner: row.get(2)?,
            data_source: row.get(3)?,
            frequency: row.get(4)?,
            start_at: row.get(5)?,
            next_run_at: row.get(6)?,
            last_run_at: row.get(7)?,
            format_options: row.get(8)?,
            recipients: row.get(9)?,
            subject: row.get(10)?,
            message: row.get(11)?,
            status: row.get(12)?,
            last_error: row.get(13)?,
            lease_owner: row.get(14)?,
            lease_expires_at: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
            recurrence: row.get(18)?,
        })
    }

    /// Decode and re-validate a stored row.
    fn into_job(self) -> Result<ScheduleJob> {
        let format: FormatOptions = serde_json::from_str(&self.format_options).map_err(|e| {
            ReportError::Validation(format!("job {} has invalid format options: {e}", self.id))
        })?;
        let recipients: Vec<Recipient> = serde_json::from_str(&self.recipients).map_err(|e| {
            ReportError::Validation(format!("job {} has invalid recipients: {e}", self.id))
        })?;
        let recurrence: Recurrence = serde_json::from_str(&self.recurrence).map_err(|e| {
            ReportError::Validation(format!("job {} has an invalid recurrence: {e}", self.id))
        })?;
        let job = ScheduleJob {
            frequency: self.frequency.parse::<Frequency>()?,
            start_at: parse_ts(&self.start_at)?,
            recurrence,
            next_run_at: parse_opt_ts(self.next_run_at)?,
            last_run_at: parse_opt_ts(self.last_run_at)?,
            format,
            recipients,
            status: self.status.parse::<JobStatus>()?,
            lease_expires_at: parse_opt_ts(self.lease_expires_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            name: self.name,
            owner: self.owner,
            data_source: self.data_source,
            subject: self.subject,
            message: self.message,
            last_error: self.last_error,
            lease_owner: self.lease_owner,
        };
        job.validate()?;
        Ok(job)
    }
}

fn get_job(conn: &Connection, id: &str) -> Result<ScheduleJob> {
    let values = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM schedule_jobs WHERE id = ?1"),
            params![id],
            JobValues::read,
        )
        .optional()
        .map_err(|e| storage("Get job", e))?
        .ok_or_else(|| ReportError::NotFound(id.to_string()))?;
    values.into_job()
}

/// Decoded jobs plus the ids of rows that failed to decode, with the reason.
type JobRows = (Vec<ScheduleJob>, Vec<(String, ReportError)>);

/// Run a job query, decoding row by row so one bad row cannot hide the rest.
fn query_jobs(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<JobRows> {
    let mut stmt = conn.prepare(sql).map_err(|e| storage("Prepare", e))?;
    let rows = stmt
        .query_map(args, JobValues::read)
        .map_err(|e| storage("Query jobs", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| storage("Read jobs", e))?;

    let mut jobs = Vec::with_capacity(rows.len());
    let mut unreadable = Vec::new();
    for values in rows {
        let id = values.id.clone();
        match values.into_job() {
            Ok(job) => jobs.push(job),
            Err(e) => {
                tracing::warn!("⚠️ Skipping unreadable job {id}: {e}");
                unreadable.push((id, e));
            }
        }
    }
    Ok((jobs, unreadable))
}
