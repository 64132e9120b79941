//! Schedule job definitions: the core data model for scheduled report work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::cadence::{self, Recurrence};
use crate::error::{ReportError, Result};

/// How often a job repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Frequency {
    OneTime,
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::OneTime => "one-time",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }
}

impl FromStr for Frequency {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "one-time" | "one_time" | "onetime" | "once" => Ok(Frequency::OneTime),
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(ReportError::Validation(format!("unknown frequency '{other}'"))),
        }
    }
}

/// Output format of the rendered report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Pdf,
    Csv,
    Excel,
    Png,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Pdf => "pdf",
            FileFormat::Csv => "csv",
            FileFormat::Excel => "excel",
            FileFormat::Png => "png",
        }
    }

    /// File extension used for the rendered payload.
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Pdf => "pdf",
            FileFormat::Csv => "csv",
            FileFormat::Excel => "xlsx",
            FileFormat::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileFormat::Pdf => "application/pdf",
            FileFormat::Csv => "text/csv",
            FileFormat::Excel => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            FileFormat::Png => "image/png",
        }
    }
}

impl FromStr for FileFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(FileFormat::Pdf),
            "csv" => Ok(FileFormat::Csv),
            "excel" | "xlsx" => Ok(FileFormat::Excel),
            "png" => Ok(FileFormat::Png),
            other => Err(ReportError::UnsupportedFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperSize {
    Letter,
    Legal,
    A4,
    A3,
}

impl PaperSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaperSize::Letter => "letter",
            PaperSize::Legal => "legal",
            PaperSize::A4 => "a4",
            PaperSize::A3 => "a3",
        }
    }

    /// Portrait (width, height) in PostScript points.
    pub fn points(&self) -> (f32, f32) {
        match self {
            PaperSize::Letter => (612.0, 792.0),
            PaperSize::Legal => (612.0, 1008.0),
            PaperSize::A4 => (595.0, 842.0),
            PaperSize::A3 => (842.0, 1191.0),
        }
    }
}

impl FromStr for PaperSize {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "letter" => Ok(PaperSize::Letter),
            "legal" => Ok(PaperSize::Legal),
            "a4" => Ok(PaperSize::A4),
            "a3" => Ok(PaperSize::A3),
            other => Err(ReportError::Validation(format!("unknown paper size '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }
}

impl FromStr for Orientation {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "portrait" => Ok(Orientation::Portrait),
            "landscape" => Ok(Orientation::Landscape),
            other => Err(ReportError::Validation(format!("unknown orientation '{other}'"))),
        }
    }
}

/// Formatting options stored with each job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    pub file_format: FileFormat,
    pub paper_size: PaperSize,
    pub orientation: Orientation,
    pub include_filters: bool,
    pub include_parameters: bool,
    /// Columns to keep, in this order. Empty keeps every column.
    #[serde(default)]
    pub selected_columns: Vec<String>,
    /// Heading of the report. Defaults to "Report: <dataset title>".
    #[serde(default)]
    pub report_title: Option<String>,
    #[serde(default = "default_true")]
    pub include_row_count: bool,
    #[serde(default = "default_true")]
    pub include_totals: bool,
    #[serde(default = "default_true")]
    pub include_averages: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            file_format: FileFormat::Pdf,
            paper_size: PaperSize::Letter,
            orientation: Orientation::Portrait,
            include_filters: false,
            include_parameters: false,
            selected_columns: Vec::new(),
            report_title: None,
            include_row_count: true,
            include_totals: true,
            include_averages: true,
        }
    }
}

impl FormatOptions {
    /// Report heading for a dataset with the given title.
    pub fn title_for(&self, dataset_title: &str) -> String {
        match self.report_title.as_deref().map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ if dataset_title.trim().is_empty() => "Report".to_string(),
            _ => format!("Report: {}", dataset_title.trim()),
        }
    }

    /// Whether the summary section has anything to show.
    pub fn wants_summary(&self) -> bool {
        self.include_row_count || self.include_totals || self.include_averages
    }

    /// Page (width, height) in points after applying orientation.
    pub fn page_points(&self) -> (f32, f32) {
        let (w, h) = self.paper_size.points();
        match self.orientation {
            Orientation::Portrait => (w, h),
            Orientation::Landscape => (h, w),
        }
    }
}

/// Delivery mechanism for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    WhatsApp,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::WhatsApp => "whatsapp",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" | "mail" => Ok(ChannelKind::Email),
            "whatsapp" => Ok(ChannelKind::WhatsApp),
            other => Err(ReportError::Validation(format!("unknown channel '{other}'"))),
        }
    }
}

/// A delivery target tagged with its channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub channel: ChannelKind,
    /// Email address or WhatsApp phone number.
    pub target: String,
}

impl Recipient {
    pub fn email(address: &str) -> Self {
        Self {
            channel: ChannelKind::Email,
            target: address.to_string(),
        }
    }

    pub fn whatsapp(number: &str) -> Self {
        Self {
            channel: ChannelKind::WhatsApp,
            target: number.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let target = self.target.trim();
        let ok = match self.channel {
            ChannelKind::Email => is_plausible_email(target),
            ChannelKind::WhatsApp => is_plausible_phone(target),
        };
        if ok {
            Ok(())
        } else {
            Err(ReportError::Validation(format!(
                "invalid {} recipient '{}'",
                self.channel, self.target
            )))
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.target)
    }
}

fn is_plausible_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.chars().any(char::is_whitespace)
        && !domain.contains('@')
}

fn is_plausible_phone(s: &str) -> bool {
    let digits = s.strip_prefix('+').unwrap_or(s);
    (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Paused,
    Failed,
    /// Terminal state of a one-time job after its run.
    Completed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Failed => "failed",
            JobStatus::Completed => "completed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            "failed" => Ok(JobStatus::Failed),
            "completed" => Ok(JobStatus::Completed),
            other => Err(ReportError::Validation(format!("unknown status '{other}'"))),
        }
    }
}

/// User input for a new job, before ids and timestamps are assigned.
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub name: String,
    pub owner: String,
    /// Dataset reference passed to the data source. Defaults to `name`.
    pub data_source: Option<String>,
    pub frequency: Frequency,
    /// First run. Defaults to the creation time.
    pub start_at: Option<DateTime<Utc>>,
    pub recurrence: Recurrence,
    pub format: FormatOptions,
    pub recipients: Vec<Recipient>,
    pub subject: Option<String>,
    pub message: Option<String>,
}

/// A persisted recurring or one-time report job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleJob {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub data_source: String,
    pub frequency: Frequency,
    /// Anchor of the schedule; its time of day is the run time and its
    /// day-of-month anchors monthly jobs without a day rule.
    pub start_at: DateTime<Utc>,
    #[serde(default)]
    pub recurrence: Recurrence,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub format: FormatOptions,
    pub recipients: Vec<Recipient>,
    pub subject: Option<String>,
    pub message: Option<String>,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleJob {
    /// Build and validate a new active job from a draft.
    pub fn new(draft: JobDraft, now: DateTime<Utc>) -> Result<Self> {
        let start_at = draft.start_at.unwrap_or(now);
        if start_at < now {
            return Err(ReportError::Validation(format!(
                "start time {} is in the past",
                start_at.to_rfc3339()
            )));
        }
        let data_source = draft
            .data_source
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| draft.name.clone());
        let recurrence = draft.recurrence.normalized();
        recurrence.validate(draft.frequency)?;
        let first = cadence::first_run(draft.frequency, start_at, &recurrence);

        let job = Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: draft.name.trim().to_string(),
            owner: draft.owner,
            data_source,
            frequency: draft.frequency,
            start_at,
            recurrence,
            next_run_at: Some(first),
            last_run_at: None,
            format: draft.format,
            recipients: draft
                .recipients
                .into_iter()
                .map(|r| Recipient {
                    channel: r.channel,
                    target: r.target.trim().to_string(),
                })
                .collect(),
            subject: draft.subject.filter(|s| !s.trim().is_empty()),
            message: draft.message.filter(|s| !s.trim().is_empty()),
            status: JobStatus::Active,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
        };
        job.validate()?;
        Ok(job)
    }

    /// Check the data-model invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ReportError::Validation("job name is required".into()));
        }
        if self.data_source.trim().is_empty() {
            return Err(ReportError::Validation("data source is required".into()));
        }
        if self.recipients.is_empty() {
            return Err(ReportError::Validation(
                "at least one recipient is required".into(),
            ));
        }
        for r in &self.recipients {
            r.validate()?;
        }
        self.recurrence.validate(self.frequency)?;
        match (self.status, self.next_run_at) {
            (JobStatus::Completed, Some(_)) => {
                return Err(ReportError::Validation(
                    "completed job cannot have a next run".into(),
                ));
            }
            (JobStatus::Completed, None) if self.frequency != Frequency::OneTime => {
                return Err(ReportError::Validation(
                    "only one-time jobs can complete".into(),
                ));
            }
            (JobStatus::Completed, None) => {}
            (_, None) => {
                return Err(ReportError::Validation(format!(
                    "{} job has no next run",
                    self.status.as_str()
                )));
            }
            (_, Some(next)) if next < self.created_at => {
                return Err(ReportError::Validation(
                    "next run precedes job creation".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Next run after the one scheduled for `previous`, skipping any that
    /// are already past at `now`. `None` once a one-time job has run.
    pub fn next_run_after(
        &self,
        previous: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, u32)> {
        cadence::next_after(self.frequency, self.start_at, &self.recurrence, previous, now)
    }

    /// Schedule in words, e.g. "Monthly on the last day at 08:00 UTC".
    pub fn describe_schedule(&self) -> String {
        cadence::describe(self.frequency, self.start_at, &self.recurrence)
    }

    /// Email subject, falling back to the default "Scheduled Report" line.
    pub fn subject_line(&self) -> String {
        self.subject
            .clone()
            .unwrap_or_else(|| format!("Scheduled Report: {}", self.name))
    }

    /// Message body, falling back to the default attachment note.
    pub fn message_body(&self) -> String {
        self.message.clone().unwrap_or_else(|| {
            format!(
                "Please find attached the scheduled report for dataset: {}",
                self.data_source
            )
        })
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every recipient received the report.
    Succeeded,
    /// Some recipients failed; the job stays active.
    Partial,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "succeeded" => Ok(RunOutcome::Succeeded),
            "partial" => Ok(RunOutcome::Partial),
            "failed" => Ok(RunOutcome::Failed),
            other => Err(ReportError::Validation(format!("unknown run outcome '{other}'"))),
        }
    }
}

/// History entry for one executed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub delivered: usize,
    /// Non-fatal per-recipient delivery warnings.
    pub warnings: Vec<String>,
    pub error: Option<String>,
}
