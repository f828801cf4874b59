//! HTTP 接口（axum）
//!
//! - POST /api/generate：阻塞 JSON 或 SSE 流（quota → chunk* → done | error）
//! - GET  /api/rate-limit-status?user_id=
//! - POST /api/title
//! - PUT  /api/admin/limits
//! - POST /api/config/reload
//! - GET  /api/health
//!
//! 配额用尽统一返回 429 RATE_LIMIT_EXCEEDED（流式请求同样在建立 SSE 之前返回）。

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::app::GatewayComponents;
use crate::config::{load_config, reload_config, QuotaLimitsSection};
use crate::core::{
    GatewayController, GatewayError, GenerateOutcome, GenerateRequest, ReplyStream, StreamOutcome,
    RATE_LIMIT_EXCEEDED,
};
use crate::quota::{FeatureQuota, FeatureType, QuotaDecision, QuotaLimits};

pub struct AppState {
    controller: Arc<GatewayController>,
    limits: Arc<QuotaLimits>,
    /// 启动时显式指定的配置文件；热更新时重新读取
    config_path: Option<PathBuf>,
    /// 关闭时结束所有 SSE 流
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        components: &GatewayComponents,
        config_path: Option<PathBuf>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            controller: Arc::clone(&components.controller),
            limits: Arc::clone(&components.limits),
            config_path,
            shutdown,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/generate", post(api_generate))
        .route("/api/rate-limit-status", get(api_rate_limit_status))
        .route("/api/title", post(api_title))
        .route("/api/admin/limits", put(api_admin_limits))
        .route("/api/config/reload", post(api_config_reload))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota: Option<QuotaDecision>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            code: self.code(),
            message: self.public_message(),
            quota: None,
        };
        (status, Json(body)).into_response()
    }
}

fn denied_response(feature: FeatureType, decision: QuotaDecision, controller: &GatewayController) -> Response {
    let body = ErrorBody {
        code: RATE_LIMIT_EXCEEDED,
        message: format!(
            "Daily limit for {} reached. Resets in {}",
            feature,
            decision.reset_in(controller.now())
        ),
        quota: Some(decision),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, GatewayError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| GatewayError::Validation(e.body_text()))
}

fn parse_feature(raw: &str) -> Result<FeatureType, GatewayError> {
    raw.parse::<FeatureType>()
        .map_err(|e| GatewayError::Validation(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    user_id: String,
    feature_type: String,
    #[serde(default)]
    session_id: Option<String>,
    message: String,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    text: String,
    quota: QuotaDecision,
}

/// POST /api/generate
async fn api_generate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let body = json_body(payload)?;
    let feature = parse_feature(&body.feature_type)?;
    let req = GenerateRequest {
        user_id: body.user_id,
        feature,
        session_id: body.session_id.filter(|s| !s.is_empty()),
        message: body.message,
    };

    if !body.stream {
        return match state.controller.generate(req).await? {
            GenerateOutcome::Denied(decision) => Ok(denied_response(feature, decision, &state.controller)),
            GenerateOutcome::Completed { text, quota } => {
                Ok(Json(GenerateResponse { text, quota }).into_response())
            }
        };
    }

    match state.controller.generate_stream(req).await? {
        StreamOutcome::Denied(decision) => Ok(denied_response(feature, decision, &state.controller)),
        StreamOutcome::Streaming { quota, chunks } => {
            let events = sse_events(quota, chunks, state.shutdown.clone());
            Ok(Sse::new(events)
                .keep_alive(
                    KeepAlive::new()
                        .interval(std::time::Duration::from_secs(15))
                        .text("keepalive"),
                )
                .into_response())
        }
    }
}

/// 事件顺序：quota → chunk* → done，或中途 error 后结束。
/// 客户端断开时 axum 丢弃本流，ReplyStream 随之被丢弃并取消上游。
fn sse_events(
    quota: QuotaDecision,
    chunks: ReplyStream,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let first = stream::once(async move {
        Ok(Event::default()
            .event("quota")
            .json_data(quota)
            .unwrap_or_else(|_| Event::default().event("quota")))
    });

    let rest = stream::unfold(Some(chunks), move |state| {
        let shutdown = shutdown.clone();
        async move {
            let mut chunks = state?;
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(request_id = %chunks.request_id(), "server shutting down, closing stream");
                    return None;
                }
                n = chunks.next() => n,
            };
            match next {
                Some(Ok(text)) => Some((
                    Ok(Event::default().event("chunk").data(sse_line_endings(&text))),
                    Some(chunks),
                )),
                Some(Err(e)) => {
                    let body = ErrorBody {
                        code: e.code(),
                        message: e.public_message(),
                        quota: None,
                    };
                    let event = Event::default()
                        .event("error")
                        .json_data(&body)
                        .unwrap_or_else(|_| Event::default().event("error").data(e.code()));
                    Some((Ok(event), None))
                }
                None => Some((Ok(Event::default().event("done").data("[DONE]")), None)),
            }
        }
    });

    first.chain(rest)
}

/// SSE 字段值不允许出现 `\r`；统一换成 `\n`，由 axum 拆成多行 data
fn sse_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    user_id: String,
    features: Vec<FeatureQuota>,
}

/// GET /api/rate-limit-status?user_id=
async fn api_rate_limit_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, GatewayError> {
    let user_id = query
        .user_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| GatewayError::Validation("user_id is required".to_string()))?;
    let features = state.controller.quota_status(&user_id).await?;
    Ok(Json(StatusResponse { user_id, features }))
}

#[derive(Debug, Deserialize)]
struct TitleBody {
    first_message: String,
}

#[derive(Debug, Serialize)]
struct TitleResponse {
    title: String,
}

/// POST /api/title
async fn api_title(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TitleBody>, JsonRejection>,
) -> Result<Json<TitleResponse>, GatewayError> {
    let body = json_body(payload)?;
    let title = state.controller.title(&body.first_message).await?;
    Ok(Json(TitleResponse { title }))
}

#[derive(Debug, Deserialize)]
struct LimitBody {
    feature_type: String,
    limit: u32,
}

#[derive(Debug, Serialize)]
struct LimitResponse {
    feature_type: FeatureType,
    limit: u32,
}

/// PUT /api/admin/limits：运行时调整某功能的每日上限
async fn api_admin_limits(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LimitBody>, JsonRejection>,
) -> Result<Json<LimitResponse>, GatewayError> {
    let body = json_body(payload)?;
    let feature = parse_feature(&body.feature_type)?;
    state.limits.set(feature, body.limit).await;
    tracing::info!(feature = %feature, limit = body.limit, "daily limit updated");
    Ok(Json(LimitResponse {
        feature_type: feature,
        limit: body.limit,
    }))
}

#[derive(Debug, Serialize)]
struct ReloadResponse {
    limits: Vec<LimitResponse>,
}

/// POST /api/config/reload：重新读取配置并整体替换配额上限
async fn api_config_reload(State(state): State<Arc<AppState>>) -> Response {
    let loaded = match state.config_path.clone() {
        Some(path) => load_config(Some(path)),
        None => reload_config(),
    };
    let cfg = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("config reload failed: {}", e);
            let body = ErrorBody {
                code: "INTERNAL_ERROR",
                message: "Failed to reload configuration.".to_string(),
                quota: None,
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
        }
    };
    state.limits.replace_all(&cfg.quota.limits).await;
    tracing::info!("quota limits reloaded from configuration");
    Json(ReloadResponse {
        limits: limit_list(&cfg.quota.limits),
    })
    .into_response()
}

fn limit_list(section: &QuotaLimitsSection) -> Vec<LimitResponse> {
    FeatureType::ALL
        .iter()
        .map(|f| LimitResponse {
            feature_type: *f,
            limit: section.limit_for(*f),
        })
        .collect()
}
