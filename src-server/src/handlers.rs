//! HTTP routes over [`JobService`].
//!
//! The caller's owner id comes from the `x-owner-id` header. Every response
//! body is an [`ApiResponse`] envelope.

use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

use manuscript::pipeline::ResumeStrategy;
use manuscript::service::{JobListResponse, JobStatusView};
use manuscript::store::{Artifact, Unit};
use manuscript::{JobStatus, ServiceError, SubmitRequest, SubmitResponse, WorkerError};

use crate::state::AppState;

pub const OWNER_HEADER: &str = "x-owner-id";

/// Standard API response wrapper.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            log::error!("Request failed: {}", self.message);
        }
        (self.status, Json(ApiResponse::<()>::err(self.message))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::NotFound(_) | ServiceError::NoContent(_) => StatusCode::NOT_FOUND,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::InvalidInput(_) | ServiceError::UnknownModel(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Admission(e) if e.is_rejection() => StatusCode::TOO_MANY_REQUESTS,
            ServiceError::InvalidState(_) | ServiceError::Worker(WorkerError::AlreadyRunning(_)) => {
                StatusCode::CONFLICT
            }
            ServiceError::Worker(WorkerError::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Admission(_) | ServiceError::Recovery(_) | ServiceError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// The caller's owner id.
pub struct Owner(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::UNAUTHORIZED,
                    format!("missing {} header", OWNER_HEADER),
                )
            })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(job_status).delete(delete_job))
        .route("/jobs/:id/resume", post(resume_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/partial", get(get_partial).post(save_partial))
        .route("/jobs/:id/artifact", get(get_artifact))
        .route("/jobs/:id/units", get(list_units))
        .route("/jobs/:id/events", get(job_events))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn submit_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<ApiResponse<SubmitResponse>>), ApiError> {
    let response = state.service.submit(&owner, request)?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::ok(response))))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Must match the caller when given.
    pub owner: Option<String>,
    /// Comma-separated statuses.
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn parse_statuses(raw: Option<&str>) -> Result<Vec<JobStatus>, ApiError> {
    raw.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<JobStatus>()
                    .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e))
            })
            .collect()
    })
    .unwrap_or_else(|| Ok(Vec::new()))
}

async fn list_jobs(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<ListQuery>,
) -> ApiResult<JobListResponse> {
    if query.owner.as_deref().is_some_and(|o| o != owner) {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "cannot list another owner's jobs",
        ));
    }
    let statuses = parse_statuses(query.status.as_deref())?;
    let limit = Some(query.limit.unwrap_or(50).min(500));
    let jobs = state
        .service
        .list(&owner, &statuses, limit, query.offset)?;
    Ok(Json(ApiResponse::ok(jobs)))
}

async fn job_status(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> ApiResult<JobStatusView> {
    Ok(Json(ApiResponse::ok(state.service.status(&owner, &job_id)?)))
}

async fn delete_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> ApiResult<()> {
    state.service.delete(&owner, &job_id)?;
    Ok(Json(ApiResponse::ok(())))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeQuery {
    pub strategy: Option<ResumeStrategy>,
}

async fn resume_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
    Query(query): Query<ResumeQuery>,
) -> ApiResult<JobStatusView> {
    let view = state
        .service
        .resume(&owner, &job_id, query.strategy.unwrap_or_default())?;
    Ok(Json(ApiResponse::ok(view)))
}

async fn cancel_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> ApiResult<JobStatusView> {
    Ok(Json(ApiResponse::ok(state.service.cancel(&owner, &job_id)?)))
}

async fn get_partial(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> ApiResult<Artifact> {
    Ok(Json(ApiResponse::ok(
        state.service.get_partial(&owner, &job_id)?,
    )))
}

async fn save_partial(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> ApiResult<Artifact> {
    Ok(Json(ApiResponse::ok(
        state.service.save_partial(&owner, &job_id)?,
    )))
}

async fn get_artifact(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> ApiResult<Artifact> {
    Ok(Json(ApiResponse::ok(state.service.artifact(&owner, &job_id)?)))
}

async fn list_units(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> ApiResult<Vec<Unit>> {
    Ok(Json(ApiResponse::ok(state.service.units(&owner, &job_id)?)))
}

fn sse_event<T: Serialize>(name: &str, payload: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|e| {
            log::warn!("Failed to encode {} event: {}", name, e);
            Event::default().event(name).data("{}")
        })
}

/// Streams the job's progress: one `status` snapshot, then `progress`
/// events until the job reaches a terminal status.
async fn job_events(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut rx = state.service.subscribe();
    let snapshot = state.service.status(&owner, &job_id)?;

    let events = stream! {
        let finished = snapshot.status.is_terminal();
        yield Ok::<_, Infallible>(sse_event("status", &snapshot));
        if !finished {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.job_id != job_id {
                            continue;
                        }
                        let done = event.is_terminal();
                        yield Ok(sse_event("progress", &event));
                        if done {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Event stream for job {} skipped {} event(s)", job_id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use manuscript::config::{AdmissionSettings, StallSettings};
    use manuscript::db::Database;
    use manuscript::planner::PLAN_SYSTEM_PROMPT;
    use manuscript::provider::StubProvider;
    use manuscript::{JobService, JobStore, ModelRoute, ModelRouter, PipelineConfig};

    const ONE_UNIT: &str = r#"{"title": "Owls", "units": [{"index": 0, "title": "Night"}]}"#;

    fn service() -> Arc<JobService> {
        let stub = Arc::new(StubProvider::new("stub").reply_when(PLAN_SYSTEM_PROMPT, ONE_UNIT));
        let router = ModelRouter::new("default").with_route("default", ModelRoute::single(stub, "m"));
        Arc::new(JobService::new(
            JobStore::new(Database::open_in_memory().unwrap()),
            Arc::new(router),
            PipelineConfig::default(),
            AdmissionSettings::default(),
            StallSettings::default(),
        ))
    }

    fn request(method: &str, uri: &str, owner: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header(OWNER_HEADER, owner);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(AppState::new(service()));
        let (status, body) = call(&app, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_owner_header_required() {
        let app = router(AppState::new(service()));
        let (status, body) = call(&app, request("GET", "/jobs", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_submit_then_read_back() {
        let service = service();
        let app = router(AppState::new(Arc::clone(&service)));

        let (status, body) = call(
            &app,
            request("POST", "/jobs", Some("alice"), Some(r#"{"input": {"prompt": "Owls"}}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "started");
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

        service.pool().wait_idle().await;

        let (status, body) = call(&app, request("GET", &format!("/jobs/{}", job_id), Some("alice"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "completed");
        assert_eq!(body["data"]["progress_percent"], 100);
        assert_eq!(body["data"]["stalled"], false);

        let (status, body) = call(
            &app,
            request("GET", &format!("/jobs/{}/artifact", job_id), Some("alice"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["content"].as_str().unwrap().starts_with("# Owls"));

        let (status, _) = call(&app, request("GET", &format!("/jobs/{}", job_id), Some("mallory"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&app, request("GET", "/jobs?status=completed", Some("alice"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total"], 1);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let app = router(AppState::new(service()));

        let (status, _) = call(&app, request("GET", "/jobs/nope", Some("alice"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            request("POST", "/jobs", Some("alice"), Some(r#"{"input": {"prompt": "  "}}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            request(
                "POST",
                "/jobs",
                Some("alice"),
                Some(r#"{"input": {"prompt": "x"}, "model_selector": "nope"}"#),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, request("GET", "/jobs?status=running", Some("alice"), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, request("GET", "/jobs?owner=bob", Some("alice"), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
