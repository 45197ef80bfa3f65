//! HTTP 接入层
//!
//! 只负责请求校验和调用流水线，业务逻辑都在 [`PipelineOrchestrator`] 中。

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use medbridge_core::{
    AuditLogEntry, AuditQuery, AuditStatus, Direction, IntegrationType, MedbridgeError,
    ProcessingStats,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::pipeline::{InboundRequest, InboundResponse, PipelineOrchestrator};

/// API状态
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<PipelineOrchestrator>,
}

impl ApiState {
    pub fn new(pipeline: Arc<PipelineOrchestrator>) -> Self {
        Self { pipeline }
    }
}

/// API错误响应
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// 流水线错误 → HTTP 状态码
pub fn status_for(err: &MedbridgeError) -> StatusCode {
    match err {
        e if e.is_payload_error() => StatusCode::UNPROCESSABLE_ENTITY,
        e if e.is_collaborator_error() => StatusCode::BAD_GATEWAY,
        MedbridgeError::DuplicateEventId(_) => StatusCode::CONFLICT,
        MedbridgeError::NotFound(_) => StatusCode::NOT_FOUND,
        MedbridgeError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<MedbridgeError> for ApiError {
    fn from(err: MedbridgeError) -> Self {
        Self {
            status: status_for(&err),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "statusCode": self.status.as_u16(),
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

/// 入站受理响应
#[derive(Debug, Serialize, Deserialize)]
pub struct InboundAccepted {
    pub message: String,
    pub result: InboundResponse,
}

/// 最近审计记录查询参数
#[derive(Debug, Default, Deserialize)]
pub struct RecentParams {
    #[serde(rename = "type")]
    pub integration_type: Option<IntegrationType>,
    pub status: Option<AuditStatus>,
    pub direction: Option<Direction>,
    pub source: Option<String>,
    pub limit: Option<usize>,
}

impl From<RecentParams> for AuditQuery {
    fn from(params: RecentParams) -> Self {
        let defaults = AuditQuery::default();
        Self {
            integration_type: params.integration_type,
            status: params.status,
            direction: params.direction,
            source: params.source,
            limit: params.limit.unwrap_or(defaults.limit),
        }
    }
}

/// 审计统计响应
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditStatsResponse {
    pub by_status: BTreeMap<String, u64>,
    pub processing: ProcessingStats,
}

/// API处理器
pub struct ApiHandler;

impl ApiHandler {
    /// 接收外部系统推送的数据
    pub async fn receive_inbound(
        State(state): State<ApiState>,
        payload: Result<Json<InboundRequest>, JsonRejection>,
    ) -> Result<Json<InboundAccepted>, ApiError> {
        let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
        if request.data.trim().is_empty() {
            return Err(ApiError::bad_request("data must not be empty"));
        }

        let result = state.pipeline.process_inbound(request).await?;
        Ok(Json(InboundAccepted {
            message: "Inbound received".to_string(),
            result,
        }))
    }

    /// 健康检查
    pub async fn health_check() -> Json<serde_json::Value> {
        Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }

    /// Prometheus 指标
    pub async fn metrics(State(state): State<ApiState>) -> Result<Response, ApiError> {
        let body = state.pipeline.metrics().render()?;
        Ok((
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response())
    }

    pub async fn get_audit_entry(
        State(state): State<ApiState>,
        Path(event_id): Path<String>,
    ) -> Result<Json<AuditLogEntry>, ApiError> {
        debug!("Looking up audit entry {}", event_id);
        state
            .pipeline
            .audit()
            .find_by_event_id(&event_id)
            .await?
            .map(Json)
            .ok_or_else(|| MedbridgeError::NotFound(event_id).into())
    }

    pub async fn recent_audit_entries(
        State(state): State<ApiState>,
        Query(params): Query<RecentParams>,
    ) -> Result<Json<Vec<AuditLogEntry>>, ApiError> {
        let query = AuditQuery::from(params);
        let entries = state.pipeline.audit().find_recent(&query).await?;
        Ok(Json(entries))
    }

    pub async fn audit_stats(
        State(state): State<ApiState>,
    ) -> Result<Json<AuditStatsResponse>, ApiError> {
        let audit = state.pipeline.audit();
        let by_status = audit
            .count_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();
        let processing = audit.processing_stats().await?;
        Ok(Json(AuditStatsResponse {
            by_status,
            processing,
        }))
    }
}

async fn log_requests(req: Request, next: Next) -> Response {
    info!("API request: {} {}", req.method(), req.uri());
    let response = next.run(req).await;
    info!("API response: {}", response.status());
    response
}

/// 创建API路由
pub fn create_api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/webhooks/inbound", post(ApiHandler::receive_inbound))
        .route("/health", get(ApiHandler::health_check))
        .route("/metrics", get(ApiHandler::metrics))
        .route("/audit/recent", get(ApiHandler::recent_audit_entries))
        .route("/audit/stats", get(ApiHandler::audit_stats))
        .route("/audit/:event_id", get(ApiHandler::get_audit_entry))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
}

/// API服务器
pub struct ApiServer {
    app: Router,
}

impl ApiServer {
    pub fn new(state: ApiState) -> Self {
        let app = create_api_routes(state)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .layer(tower_http::cors::CorsLayer::permissive());
        Self { app }
    }

    pub async fn run<F>(self, addr: &str, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting API server on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::message_queue::{EventPublisher, InMemoryTransport};
    use crate::metrics::InboundMetrics;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use medbridge_core::LoggerRegistry;
    use serde_json::Value;
    use tower::ServiceExt;

    const ORU_MESSAGE: &str = "MSH|^~\\&|LAB|ExtLab|||20250126||ORU^R01|MSG001|P|2.5\rPID|1||P001||Silva^João||19900101|M\rOBR|1||ORD001|GLU^Glicose\rOBX|1|NM|GLU^Glucose^LOINC||95|mg/dL|70-100|N";

    fn app() -> Router {
        let logging = LoggerRegistry::default();
        let publisher = Arc::new(EventPublisher::new(
            Arc::new(InMemoryTransport::new(&logging)),
            &logging,
        ));
        let pipeline = PipelineOrchestrator::new(
            Arc::new(InMemoryAuditStore::new(&logging)),
            publisher,
            InboundMetrics::new().unwrap(),
            &logging,
        );
        create_api_routes(ApiState::new(Arc::new(pipeline)))
    }

    fn post_inbound(body: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri("/webhooks/inbound")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_inbound_hl7_accepted() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_inbound(json!({"data": ORU_MESSAGE, "source": "lab-a"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["message"], "Inbound received");
        assert_eq!(body["result"]["success"], true);
        assert_eq!(body["result"]["resource"]["id"], "LAB-UNKNOWN-1");

        let event_id = body["result"]["eventId"].as_str().unwrap().to_string();
        let response = app
            .clone()
            .oneshot(get_request(&format!("/audit/{}", event_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let entry = body_json(response).await;
        assert_eq!(entry["status"], "success");
        assert_eq!(entry["type"], "HL7");
        assert_eq!(entry["source"], "lab-a");

        let response = app.oneshot(get_request("/audit/recent?type=HL7&limit=5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let recent = body_json(response).await;
        assert_eq!(recent.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_or_missing_data_is_bad_request() {
        let response = app().oneshot(post_inbound(json!({"data": "  "}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app().oneshot(post_inbound(json!({"source": "x"}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_payload_errors_are_unprocessable() {
        let response = app()
            .oneshot(post_inbound(json!({"data": "plain text"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let message = ORU_MESSAGE.replace("ORU^R01", "ADT^A01");
        let response = app().oneshot(post_inbound(json!({"data": message}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("HL7 to FHIR transformation failed"));
    }

    #[tokio::test]
    async fn test_unknown_audit_entry_is_not_found() {
        let response = app().oneshot(get_request("/audit/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_health_and_metrics() {
        let app = app();
        app.clone()
            .oneshot(post_inbound(json!({"data": "{\"order\": 1}"})))
            .await
            .unwrap();

        let stats = body_json(app.clone().oneshot(get_request("/audit/stats")).await.unwrap()).await;
        assert_eq!(stats["byStatus"]["success"], 1);
        assert_eq!(stats["processing"]["count"], 1);

        let health = body_json(app.clone().oneshot(get_request("/health")).await.unwrap()).await;
        assert_eq!(health["status"], "healthy");

        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("medbridge_inbound_total"));
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_for(&MedbridgeError::DuplicateEventId("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&MedbridgeError::Store("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&MedbridgeError::MalformedJson("eof".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }
}
