//! API route handlers for the gateway.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc, Weekday};
use serde::Deserialize;
use std::sync::Arc;
use tabreport_core::{
    ChannelKind, FileFormat, FormatOptions, Frequency, JobDraft, JobStatus, MonthDay,
    Orientation, PaperSize, Recipient, Recurrence, ReportError, ScheduleJob,
};

use super::server::AppState;

const OWNER_HEADER: &str = "x-user-id";
const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

/// A `ReportError` rendered as `{"ok": false, "error": ...}` with a matching status.
#[derive(Debug)]
pub struct ApiError(pub ReportError);

impl From<ReportError> for ApiError {
    fn from(e: ReportError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ReportError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ API error: {}", self.0);
        }
        (
            status,
            Json(serde_json::json!({"ok": false, "error": self.0.to_string()})),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn owner_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn job_json(job: &ScheduleJob) -> serde_json::Value {
    serde_json::json!({
        "id": job.id,
        "name": job.name,
        "owner": job.owner,
        "dataset": job.data_source,
        "frequency": job.frequency.as_str(),
        "days": job.recurrence.weekdays.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        "monthDay": job.recurrence.month_day,
        "schedule": job.describe_schedule(),
        "startAt": job.start_at,
        "nextRunAt": job.next_run_at,
        "lastRunAt": job.last_run_at,
        "format": job.format.file_format.as_str(),
        "paperSize": job.format.paper_size.as_str(),
        "orientation": job.format.orientation.as_str(),
        "includeFilters": job.format.include_filters,
        "includeParameters": job.format.include_parameters,
        "selectedColumns": job.format.selected_columns,
        "reportTitle": job.format.report_title,
        "includeRowCount": job.format.include_row_count,
        "includeTotals": job.format.include_totals,
        "includeAverages": job.format.include_averages,
        "recipients": job.recipients,
        "subject": job.subject_line(),
        "message": job.message,
        "status": job.status.as_str(),
        "lastError": job.last_error,
        "createdAt": job.created_at,
        "updatedAt": job.updated_at,
    })
}

/// Health check.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tabreport",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// A recipient as submitted: a bare address/number, or an explicit channel + target.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecipientInput {
    Plain(String),
    Tagged { channel: String, target: String },
}

impl RecipientInput {
    fn into_recipient(self) -> Result<Recipient, ReportError> {
        match self {
            // Anything with an @ is an email address, everything else a phone number.
            RecipientInput::Plain(s) if s.contains('@') => Ok(Recipient::email(s.trim())),
            RecipientInput::Plain(s) => Ok(Recipient::whatsapp(s.trim())),
            RecipientInput::Tagged { channel, target } => Ok(Recipient {
                channel: channel.parse::<ChannelKind>()?,
                target: target.trim().to_string(),
            }),
        }
    }
}

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// A weekday as submitted: 0 (Monday) to 6 (Sunday), or a name like "Mon" or "friday".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WeekdayInput {
    Index(u8),
    Name(String),
}

impl WeekdayInput {
    fn into_weekday(self) -> Result<Weekday, ReportError> {
        match self {
            WeekdayInput::Index(i) if i < 7 => Ok(WEEK[i as usize]),
            WeekdayInput::Index(i) => Err(ReportError::Validation(format!(
                "weekday index must be 0 (Monday) to 6 (Sunday), got {i}"
            ))),
            WeekdayInput::Name(name) => name
                .trim()
                .parse::<Weekday>()
                .map_err(|_| ReportError::Validation(format!("unknown weekday '{name}'"))),
        }
    }
}

/// Day of month as submitted: a number, or "last day", "first weekday", "last weekday".
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MonthDayInput {
    Number(u32),
    Name(String),
}

impl MonthDayInput {
    fn into_month_day(self) -> Result<MonthDay, ReportError> {
        match self {
            MonthDayInput::Number(d) => Ok(MonthDay::Day(d)),
            MonthDayInput::Name(s) => s.parse(),
        }
    }
}

/// Body of `POST /api/schedule/create`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    pub name: Option<String>,
    pub frequency: Option<String>,
    pub format: Option<String>,
    pub paper_size: Option<String>,
    pub orientation: Option<String>,
    pub include_filters: Option<bool>,
    pub include_parameters: Option<bool>,
    #[serde(default)]
    pub selected_columns: Vec<String>,
    pub report_title: Option<String>,
    pub include_row_count: Option<bool>,
    pub include_totals: Option<bool>,
    pub include_averages: Option<bool>,
    /// Weekly jobs: the days to run on.
    #[serde(default)]
    pub days: Vec<WeekdayInput>,
    /// Monthly jobs: which day of the month to run on.
    pub month_day: Option<MonthDayInput>,
    #[serde(default)]
    pub recipients: Vec<RecipientInput>,
    /// Dataset reference; defaults to the schedule name.
    pub dataset: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub subject: Option<String>,
    pub message: Option<String>,
}

impl CreateScheduleRequest {
    fn into_draft(self, owner: String) -> Result<JobDraft, ReportError> {
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ReportError::Validation("name is required".into()))?;
        let frequency = self
            .frequency
            .ok_or_else(|| ReportError::Validation("frequency is required".into()))?
            .parse::<Frequency>()?;
        let defaults = FormatOptions::default();
        let format = FormatOptions {
            file_format: match self.format {
                Some(f) => f.parse::<FileFormat>()?,
                None => defaults.file_format,
            },
            paper_size: match self.paper_size {
                Some(p) => p.parse::<PaperSize>()?,
                None => defaults.paper_size,
            },
            orientation: match self.orientation {
                Some(o) => o.parse::<Orientation>()?,
                None => defaults.orientation,
            },
            include_filters: self.include_filters.unwrap_or(false),
            include_parameters: self.include_parameters.unwrap_or(false),
            selected_columns: self
                .selected_columns
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            report_title: self.report_title.filter(|t| !t.trim().is_empty()),
            include_row_count: self.include_row_count.unwrap_or(defaults.include_row_count),
            include_totals: self.include_totals.unwrap_or(defaults.include_totals),
            include_averages: self.include_averages.unwrap_or(defaults.include_averages),
        };
        let recurrence = Recurrence {
            weekdays: self
                .days
                .into_iter()
                .map(WeekdayInput::into_weekday)
                .collect::<Result<Vec<_>, _>>()?,
            month_day: self.month_day.map(MonthDayInput::into_month_day).transpose()?,
        };
        let recipients = self
            .recipients
            .into_iter()
            .map(RecipientInput::into_recipient)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobDraft {
            name,
            owner,
            data_source: self.dataset,
            frequency,
            start_at: self.start_at,
            recurrence,
            format,
            recipients,
            subject: self.subject,
            message: self.message,
        })
    }
}

/// Create a schedule.
pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<CreateScheduleRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) =
        payload.map_err(|e| ReportError::Validation(format!("invalid request body: {e}")))?;
    let owner = owner_of(&headers).unwrap_or_else(|| "anonymous".into());
    let job = ScheduleJob::new(req.into_draft(owner)?, Utc::now())?;
    let id = state.store.create(&job)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "id": id,
        "schedule": job_json(&job),
    })))
}

/// List schedules, restricted to the caller when `X-User-Id` is sent.
pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let owner = owner_of(&headers);
    let jobs: Vec<serde_json::Value> = state
        .store
        .list()?
        .iter()
        .filter(|j| owner.as_ref().is_none_or(|o| &j.owner == o))
        .map(job_json)
        .collect();
    Ok(Json(serde_json::json!({
        "ok": true,
        "count": jobs.len(),
        "schedules": jobs,
    })))
}

/// Get one schedule with its status and last error.
pub async fn get_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult {
    let job = state.store.get(&id)?;
    Ok(Json(serde_json::json!({"ok": true, "schedule": job_json(&job)})))
}

/// Delete a schedule and its run history.
pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    state.store.delete(&id)?;
    Ok(Json(serde_json::json!({"ok": true})))
}

/// Stop a schedule from running until it is resumed.
pub async fn pause_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let job = state.store.modify(&id, |job| {
        if job.status == JobStatus::Completed {
            return Err(ReportError::Validation(
                "a completed schedule cannot be paused".into(),
            ));
        }
        job.status = JobStatus::Paused;
        Ok(())
    })?;
    tracing::info!("⏸️ Schedule paused: '{}' ({})", job.name, job.id);
    Ok(Json(serde_json::json!({"ok": true, "schedule": job_json(&job)})))
}

/// Reactivate a paused or failed schedule, clearing its last error.
pub async fn resume_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult {
    let job = state.store.modify(&id, |job| {
        if job.status == JobStatus::Completed {
            return Err(ReportError::Validation(
                "a completed schedule cannot be resumed".into(),
            ));
        }
        job.status = JobStatus::Active;
        job.last_error = None;
        Ok(())
    })?;
    tracing::info!("▶️ Schedule resumed: '{}' ({})", job.name, job.id);
    Ok(Json(serde_json::json!({"ok": true, "schedule": job_json(&job)})))
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// Recent runs of a schedule, newest first.
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
) -> ApiResult {
    state.store.get(&id)?;
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    let runs = state.store.runs_for(&id, limit)?;
    Ok(Json(serde_json::json!({"ok": true, "runs": runs})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tabreport_scheduler::ScheduleStore;
    use tower::ServiceExt;

    fn test_state() -> State<Arc<AppState>> {
        State(Arc::new(AppState::new(
            Arc::new(ScheduleStore::open_in_memory().unwrap()),
            std::env::temp_dir().join("tabreport-test-reports"),
        )))
    }

    fn request(body: serde_json::Value) -> Result<Json<CreateScheduleRequest>, JsonRejection> {
        Ok(Json(serde_json::from_value(body).unwrap()))
    }

    fn owner(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(OWNER_HEADER, id.parse().unwrap());
        headers
    }

    async fn create(state: &State<Arc<AppState>>, body: serde_json::Value) -> ApiResult {
        create_schedule(state.clone(), owner("u-42"), request(body)).await
    }

    fn status_of(result: ApiResult) -> StatusCode {
        match result {
            Ok(_) => StatusCode::OK,
            Err(e) => e.into_response().status(),
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let json = health_check(test_state()).await.0;
        assert_eq!(json["status"], "ok");
        assert!(json["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn test_create_weekly_on_selected_days() {
        let state = test_state();
        let created = create(
            &state,
            serde_json::json!({
                "name": "Standup numbers", "frequency": "weekly",
                "days": ["Wed", 0, "monday"],
                "startAt": "2030-03-04T08:00:00Z",
                "recipients": ["ops@example.com"],
            }),
        )
        .await
        .unwrap()
        .0;
        let schedule = &created["schedule"];
        assert_eq!(schedule["days"], serde_json::json!(["Mon", "Wed"]));
        assert_eq!(schedule["schedule"], "Weekly on Monday, Wednesday at 08:00 UTC");
        assert!(schedule["monthDay"].is_null());

        let bad_day = create(
            &state,
            serde_json::json!({
                "name": "x", "frequency": "weekly", "days": [9],
                "recipients": ["ops@example.com"],
            }),
        )
        .await;
        assert_eq!(status_of(bad_day), StatusCode::BAD_REQUEST);

        let days_on_daily = create(
            &state,
            serde_json::json!({
                "name": "x", "frequency": "daily", "days": ["Fri"],
                "recipients": ["ops@example.com"],
            }),
        )
        .await;
        assert_eq!(status_of(days_on_daily), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_monthly_on_last_day() {
        let state = test_state();
        let created = create(
            &state,
            serde_json::json!({
                "name": "Month end", "frequency": "monthly", "monthDay": "Last Day",
                "startAt": "2030-02-10T06:00:00Z",
                "recipients": ["ops@example.com"],
            }),
        )
        .await
        .unwrap()
        .0;
        let schedule = &created["schedule"];
        assert_eq!(schedule["monthDay"], "last-day");
        assert_eq!(schedule["nextRunAt"], "2030-02-28T06:00:00Z");

        let out_of_range = create(
            &state,
            serde_json::json!({
                "name": "x", "frequency": "monthly", "monthDay": 32,
                "recipients": ["ops@example.com"],
            }),
        )
        .await;
        assert_eq!(status_of(out_of_range), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_create_keeps_content_options() {
        let state = test_state();
        let created = create(
            &state,
            serde_json::json!({
                "name": "Sales", "frequency": "daily",
                "selectedColumns": ["region", " amount ", ""],
                "reportTitle": "Daily sales",
                "includeAverages": false,
                "recipients": ["ops@example.com"],
            }),
        )
        .await
        .unwrap()
        .0;
        let schedule = &created["schedule"];
        assert_eq!(schedule["selectedColumns"], serde_json::json!(["region", "amount"]));
        assert_eq!(schedule["reportTitle"], "Daily sales");
        assert_eq!(schedule["includeRowCount"], true);
        assert_eq!(schedule["includeTotals"], true);
        assert_eq!(schedule["includeAverages"], false);
    }

    #[tokio::test]
    async fn test_create_get_delete_round_trip() {
        let state = test_state();
        let created = create(
            &state,
            serde_json::json!({
                "name": "Weekly sales",
                "frequency": "weekly",
                "format": "excel",
                "recipients": ["ops@example.com", "+84912345678"],
                "dataset": "sales",
            }),
        )
        .await
        .unwrap()
        .0;
        assert_eq!(created["ok"], true);
        let id = created["id"].as_str().unwrap().to_string();

        let fetched = get_schedule(state.clone(), Path(id.clone())).await.unwrap().0;
        let schedule = &fetched["schedule"];
        assert_eq!(schedule["status"], "active");
        assert_eq!(schedule["format"], "excel");
        assert_eq!(schedule["paperSize"], "letter");
        assert_eq!(schedule["orientation"], "portrait");
        assert_eq!(schedule["owner"], "u-42");
        assert_eq!(schedule["subject"], "Scheduled Report: Weekly sales");
        assert_eq!(schedule["recipients"][1]["channel"], "whatsapp");
        assert!(schedule["lastError"].is_null());

        let deleted = delete_schedule(state.clone(), Path(id.clone())).await.unwrap().0;
        assert_eq!(deleted["ok"], true);
        assert_eq!(
            status_of(get_schedule(state.clone(), Path(id.clone())).await),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(delete_schedule(state, Path(id)).await),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let state = test_state();
        let no_recipients =
            create(&state, serde_json::json!({"name": "x", "frequency": "daily"})).await;
        assert_eq!(status_of(no_recipients), StatusCode::BAD_REQUEST);

        let bad_format = create(
            &state,
            serde_json::json!({
                "name": "x", "frequency": "daily", "format": "docx",
                "recipients": ["a@example.com"],
            }),
        )
        .await;
        assert_eq!(status_of(bad_format), StatusCode::BAD_REQUEST);

        let bad_email = create(
            &state,
            serde_json::json!({
                "name": "x", "frequency": "daily",
                "recipients": [{"channel": "email", "target": "not-an-address"}],
            }),
        )
        .await;
        assert_eq!(status_of(bad_email), StatusCode::BAD_REQUEST);

        let list = list_schedules(state, HeaderMap::new()).await.unwrap().0;
        assert_eq!(list["count"], 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let state = test_state();
        let created = create(
            &state,
            serde_json::json!({
                "name": "Daily ops", "frequency": "daily",
                "recipients": ["ops@example.com"],
            }),
        )
        .await
        .unwrap()
        .0;
        let id = created["id"].as_str().unwrap().to_string();

        let paused = pause_schedule(state.clone(), Path(id.clone())).await.unwrap().0;
        assert_eq!(paused["schedule"]["status"], "paused");
        let resumed = resume_schedule(state.clone(), Path(id.clone())).await.unwrap().0;
        assert_eq!(resumed["schedule"]["status"], "active");

        let runs = list_runs(state, Path(id), Query(RunsQuery { limit: None }))
            .await
            .unwrap()
            .0;
        assert_eq!(runs["runs"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_list_filters_by_owner() {
        let state = test_state();
        for name in ["a", "b"] {
            create(
                &state,
                serde_json::json!({"name": name, "frequency": "monthly", "recipients": ["o@example.com"]}),
            )
            .await
            .unwrap();
        }
        let mine = list_schedules(state.clone(), owner("u-42")).await.unwrap().0;
        assert_eq!(mine["count"], 2);
        let theirs = list_schedules(state, owner("someone-else")).await.unwrap().0;
        assert_eq!(theirs["count"], 0);
    }

    #[tokio::test]
    async fn test_router_status_codes() {
        let State(shared) = test_state();
        let app = crate::server::build_router_from_arc(shared);

        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/schedule/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let malformed = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/schedule/create")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(malformed.into_body(), 64 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], false);

        let health = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }
}
