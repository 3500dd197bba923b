//! RealityCheck HTTP 服务
//!
//! 启动: cargo run --bin realitycheck-web --features web
//! 薄适配层：每个路由只解析请求、调用 SessionEngine、映射错误码。

#![cfg(feature = "web")]

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use realitycheck::config::load_config;
use realitycheck::core::{CoachError, EngineBuilder, ShutdownManager};
use realitycheck::session::{
    CoachUpdate, FrameOutcome, FrameSubmission, SessionEngine, SessionReport, SessionSnapshot,
    SessionStarted, SessionSupervisor, StartSession, VerifyOutcome,
};

struct AppState {
    engine: Arc<SessionEngine>,
}

/// 引擎错误 -> HTTP 状态码 + JSON 错误体
struct ApiError(CoachError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    /// 为 true 时客户端可原样重试
    retriable: bool,
}

impl From<CoachError> for ApiError {
    fn from(e: CoachError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoachError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoachError::NotFound(_) => StatusCode::NOT_FOUND,
            CoachError::StaleReference(_)
            | CoachError::Conflict(_)
            | CoachError::OutOfOrder { .. }
            | CoachError::InvalidState { .. }
            | CoachError::SessionClosed { .. } => StatusCode::CONFLICT,
            CoachError::Stage(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoachError::SessionFailed { .. } | CoachError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::warn!("request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            retriable: self.0.is_retriable(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
struct AnswerRequest {
    question_id: String,
    answer: String,
}

#[derive(Deserialize)]
struct VerifyRequest {
    step_id: String,
    evidence_ref: String,
}

#[derive(Deserialize)]
struct SkipRequest {
    step_id: String,
}

#[derive(Serialize)]
struct CoachUpdateResponse {
    coach_update: CoachUpdate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    realitycheck::observability::init();

    let cfg = load_config(None).unwrap_or_default();
    let bind = std::env::var("REALITYCHECK_BIND").unwrap_or_else(|_| cfg.server.bind.clone());
    let sweep_interval = cfg.session.sweep_interval();
    let engine = Arc::new(
        EngineBuilder::new(cfg)
            .build()
            .context("Failed to open session store")?,
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let supervisor = SessionSupervisor::with_token(sweep_interval, shutdown.child_token());
    let sweeper = supervisor.spawn(Arc::clone(&engine));

    let state = Arc::new(AppState { engine });
    let app = Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/session/start", post(api_start))
        .route("/session/:id/frame", post(api_frame))
        .route("/session/:id/answer", post(api_answer))
        .route("/session/:id/verify", post(api_verify))
        .route("/session/:id/safety/confirm", post(api_confirm_safety))
        .route("/session/:id/skip", post(api_skip))
        .route("/session/:id/report", get(api_report))
        .route("/session/:id/resume", post(api_resume))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!("RealityCheck API: http://{}", bind);

    let wait = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait.wait_for_shutdown().await })
        .await
        .context("Server failed")?;

    supervisor.cancel();
    let _ = sweeper.await;
    tracing::info!("RealityCheck API stopped");
    Ok(())
}

/// POST /session/start {goal, language, idempotency_key?}
async fn api_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSession>,
) -> ApiResult<SessionStarted> {
    Ok(Json(state.engine.start_session(req).await?))
}

/// POST /session/:id/frame {sequence, image_ref, transcript?}
async fn api_frame(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(frame): Json<FrameSubmission>,
) -> ApiResult<FrameOutcome> {
    Ok(Json(state.engine.push_frame(&id, frame).await?))
}

/// POST /session/:id/answer {question_id, answer}
async fn api_answer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult<CoachUpdateResponse> {
    let coach_update = state
        .engine
        .answer_question(&id, &req.question_id, &req.answer)
        .await?;
    Ok(Json(CoachUpdateResponse { coach_update }))
}

/// POST /session/:id/verify {step_id, evidence_ref}
async fn api_verify(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult<VerifyOutcome> {
    Ok(Json(
        state
            .engine
            .verify_step(&id, &req.step_id, &req.evidence_ref)
            .await?,
    ))
}

/// POST /session/:id/safety/confirm
async fn api_confirm_safety(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<CoachUpdateResponse> {
    let coach_update = state.engine.confirm_safety(&id).await?;
    Ok(Json(CoachUpdateResponse { coach_update }))
}

/// POST /session/:id/skip {step_id}
async fn api_skip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SkipRequest>,
) -> ApiResult<CoachUpdateResponse> {
    let coach_update = state.engine.skip_step(&id, &req.step_id).await?;
    Ok(Json(CoachUpdateResponse { coach_update }))
}

/// GET /session/:id/report
async fn api_report(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SessionReport> {
    Ok(Json(state.engine.report(&id).await?))
}

/// POST /session/:id/resume
async fn api_resume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<SessionSnapshot> {
    Ok(Json(state.engine.resume_session(&id).await?))
}
