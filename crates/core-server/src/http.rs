use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use resume_core_types::{CoreError, ErrorCategory, ErrorKind, RunRequest};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::AppState;

/// §6 HTTP surface: 6 endpoints fronting C7/C3/C4. Grounded in the
/// reference server's `app_router`/`serve` shape — graceful shutdown plus a
/// permissive CORS layer, since the client is a browser SPA on a different
/// origin.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/pipeline/start", post(start_pipeline))
        .route("/jobs/{run_id}/stream", get(stream_job))
        .route("/jobs/{run_id}/snapshot", get(job_snapshot))
        .route("/optimize-retry", post(optimize_retry))
        .route(
            "/recovery-session/{run_id}",
            get(get_recovery_session).delete(delete_recovery_session),
        )
        .route("/export/{run_id}", get(export_run))
        .layer(cors)
        .with_state(state)
}

/// Maps a `CoreError` to the HTTP status table in §6/§7. `QUOTA_EXCEEDED`
/// carries `Retry-After: 3600` per the admission contract; everything else
/// follows its `ErrorCategory`.
fn error_response(err: CoreError) -> Response {
    let status = match err.kind {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        _ => match err.category() {
            ErrorCategory::Permanent => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::Recoverable => StatusCode::BAD_GATEWAY,
            ErrorCategory::Transient => StatusCode::SERVICE_UNAVAILABLE,
        },
    };
    let body = serde_json::to_value(&err).unwrap_or_else(|_| serde_json::json!({"error": "internal"}));
    let mut response = (status, Json(body)).into_response();
    if err.kind == ErrorKind::QuotaExceeded {
        response
            .headers_mut()
            .insert("retry-after", "3600".parse().unwrap());
    }
    response
}

#[derive(Debug, Deserialize)]
struct StartPipelineRequest {
    resume_text: String,
    job_text: Option<String>,
    job_url: Option<String>,
    linkedin_url: Option<String>,
    github_username: Option<String>,
    #[serde(default)]
    models: resume_core_types::ModelOverrides,
}

const CLIENT_ID_HEADER: &str = "x-client-id";

async fn start_pipeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartPipelineRequest>,
) -> Response {
    let client_id = headers
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if client_id.is_empty() {
        return error_response(CoreError::new(
            ErrorKind::BadRequest,
            "X-Client-Id header is required",
        ));
    }

    let request = RunRequest {
        client_id,
        resume_text: body.resume_text,
        job_text: body.job_text,
        job_url: body.job_url,
        linkedin_url: body.linkedin_url,
        github_username: body.github_username,
        models: body.models,
    };

    match state.orchestrator.start_run(request).await {
        Ok(outcome) => Json(serde_json::json!({
            "run_id": outcome.run_id,
            "quota_remaining": outcome.quota_remaining,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    after_event_id: Option<u64>,
}

async fn stream_job(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, Response> {
    let after_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or(query.after_event_id)
        .unwrap_or(0);

    let events = state
        .bus
        .subscribe(run_id, after_event_id)
        .await
        .map_err(error_response)?;

    let stream = async_stream::stream! {
        use futures::StreamExt;
        let mut events = events;
        while let Some(event) = events.next().await {
            let data = serde_json::to_string(&event).unwrap_or_default();
            yield Ok(SseEvent::default()
                .id(event.event_id.to_string())
                .event(event.type_name())
                .data(data));
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10))))
}

async fn job_snapshot(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Response {
    match state.bus.snapshot(run_id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct OptimizeRetryRequest {
    session_id: Uuid,
}

async fn optimize_retry(
    State(state): State<AppState>,
    Json(body): Json<OptimizeRetryRequest>,
) -> Response {
    match state
        .orchestrator
        .retry_run(body.session_id, state.max_manual_retries)
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) if err.kind == ErrorKind::BadRequest => {
            (StatusCode::CONFLICT, Json(err)).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn get_recovery_session(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Response {
    match state.store.get_session(run_id).await {
        Ok(Some(session)) => Json(session).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

async fn delete_recovery_session(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Response {
    match state.store.delete_session(run_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: Option<String>,
}

/// §6: export delegates to the DOCX renderer collaborator. A renderer
/// failure is reported as `RENDERER_SYNTAX` without touching the run's
/// already-`completed` status.
async fn export_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<ExportQuery>,
) -> Response {
    if query.format.as_deref().unwrap_or("docx") != "docx" {
        return error_response(CoreError::new(
            ErrorKind::BadRequest,
            "only format=docx is supported",
        ));
    }

    let checkpoints = match state.store.get_checkpoints(run_id).await {
        Ok(c) => c,
        Err(err) => return error_response(err),
    };
    let Some(polisher_output) = checkpoints.into_iter().find(|c| c.agent_index == 4) else {
        return error_response(CoreError::new(
            ErrorKind::BadRequest,
            "run has no polisher output to export",
        ));
    };

    match state.renderer.render(&polisher_output.output_json).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            )],
            bytes,
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}
