//! 管理用RESTful API
//!
//! 暴露同步状态、手动同步、缓存统计与查询，以及Prometheus指标。

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use pacs_core::PacsError;
use pacs_database::{DatabaseQueries, DbInstance, DbSeries, DbStudy};
use pacs_sync::{SyncCoordinator, SyncNowResponse, SyncStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

use crate::orthanc::OrthancClient;

/// API共享状态
#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<SyncCoordinator>,
    pub orthanc: Option<Arc<OrthancClient>>,
}

impl ApiState {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            coordinator,
            orthanc: None,
        }
    }

    pub fn with_orthanc(mut self, client: Arc<OrthancClient>) -> Self {
        self.orthanc = Some(client);
        self
    }
}

/// 系统统计响应
#[derive(Debug, Serialize)]
pub struct SystemStatsResponse {
    pub total_studies: i64,
    pub total_series: i64,
    pub total_instances: i64,
    pub last_change_seq: Option<i64>,
    pub last_full_sync_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StudyListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub search: String,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct StudyListResponse {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub studies: Vec<DbStudy>,
}

#[derive(Debug, Serialize)]
pub struct SeriesDetail {
    #[serde(flatten)]
    pub series: DbSeries,
    pub instances: Vec<DbInstance>,
}

#[derive(Debug, Serialize)]
pub struct StudyDetailResponse {
    #[serde(flatten)]
    pub study: DbStudy,
    pub series: Vec<SeriesDetail>,
    pub snapshot: Option<serde_json::Value>,
}

fn internal_error(err: PacsError) -> StatusCode {
    error!("API request failed: {}", err);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// API处理器
pub struct ApiHandler;

impl ApiHandler {
    /// 健康检查
    pub async fn health_check(State(state): State<ApiState>) -> Json<HashMap<String, String>> {
        let mut status = HashMap::new();
        let queries = DatabaseQueries::new(state.coordinator.database());
        let database_ok = queries.cache_stats().await.is_ok();

        let orthanc = match &state.orthanc {
            Some(client) => match client.check_connection().await {
                Ok(_) => "reachable",
                Err(_) => "unreachable",
            },
            None => "not configured",
        };

        let healthy = database_ok && orthanc != "unreachable";
        status.insert("status".to_string(), if healthy { "healthy" } else { "degraded" }.to_string());
        status.insert("database".to_string(), if database_ok { "ok" } else { "error" }.to_string());
        status.insert("orthanc".to_string(), orthanc.to_string());
        status.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());
        status.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        Json(status)
    }

    pub async fn sync_status(State(state): State<ApiState>) -> Result<Json<SyncStatus>, StatusCode> {
        state.coordinator.status().await.map(Json).map_err(internal_error)
    }

    /// 手动触发全量同步
    pub async fn trigger_sync(State(state): State<ApiState>) -> (StatusCode, Json<SyncNowResponse>) {
        info!("Manual full sync requested");
        let response = state.coordinator.sync_now().await;
        let code = if response.success { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
        (code, Json(response))
    }

    /// 获取系统统计信息
    pub async fn get_system_stats(
        State(state): State<ApiState>,
    ) -> Result<Json<SystemStatsResponse>, StatusCode> {
        let queries = DatabaseQueries::new(state.coordinator.database());
        let stats = queries.cache_stats().await.map_err(internal_error)?;

        Ok(Json(SystemStatsResponse {
            total_studies: stats.studies,
            total_series: stats.series,
            total_instances: stats.instances,
            last_change_seq: queries.get_cursor().await.map_err(internal_error)?,
            last_full_sync_at: queries
                .get_metadata(pacs_sync::full_sync::LAST_FULL_SYNC_AT_KEY)
                .await
                .map_err(internal_error)?,
        }))
    }

    pub async fn list_studies(
        State(state): State<ApiState>,
        Query(query): Query<StudyListQuery>,
    ) -> Result<Json<StudyListResponse>, StatusCode> {
        let queries = DatabaseQueries::new(state.coordinator.database());
        let limit = query.limit.clamp(1, 1000);
        let offset = query.offset.max(0);

        let studies = queries
            .list_studies(limit, offset, &query.search)
            .await
            .map_err(internal_error)?;
        let total = queries.count_studies(&query.search).await.map_err(internal_error)?;

        Ok(Json(StudyListResponse { total, limit, offset, studies }))
    }

    pub async fn get_study(
        State(state): State<ApiState>,
        Path(study_id): Path<String>,
    ) -> Result<Json<StudyDetailResponse>, StatusCode> {
        let queries = DatabaseQueries::new(state.coordinator.database());
        let study = queries
            .get_study_by_id(&study_id)
            .await
            .map_err(internal_error)?
            .ok_or(StatusCode::NOT_FOUND)?;

        let mut series = Vec::new();
        for s in queries.get_series_by_study_id(&study_id).await.map_err(internal_error)? {
            let instances = queries
                .get_instances_by_series_id(&s.id)
                .await
                .map_err(internal_error)?;
            series.push(SeriesDetail { series: s, instances });
        }
        let snapshot = queries.get_study_snapshot(&study_id).await.map_err(internal_error)?;

        Ok(Json(StudyDetailResponse { study, series, snapshot }))
    }

    /// Prometheus文本格式指标
    pub async fn metrics(State(state): State<ApiState>) -> Result<impl IntoResponse, StatusCode> {
        let body = state.coordinator.metrics().render().map_err(internal_error)?;
        Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
    }
}

/// 创建API路由
pub fn create_api_routes(state: ApiState) -> Router {
    let api = Router::new()
        .route("/health", get(ApiHandler::health_check))
        .route("/sync", post(ApiHandler::trigger_sync))
        .route("/sync/status", get(ApiHandler::sync_status))
        .route("/system/stats", get(ApiHandler::get_system_stats))
        .route("/studies", get(ApiHandler::list_studies))
        .route("/studies/:id", get(ApiHandler::get_study));

    Router::new()
        .nest("/api/v1", api)
        .route("/metrics", get(ApiHandler::metrics))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// API服务器
pub struct ApiServer {
    app: Router,
}

impl ApiServer {
    pub fn new(state: ApiState) -> Self {
        let app = create_api_routes(state).layer(tower_http::cors::CorsLayer::permissive());
        Self { app }
    }

    pub async fn run<F>(self, addr: &str, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting API server on {}", addr);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pacs_database::{DatabasePool, NewStudy};
    use pacs_sync::SyncSettings;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn test_state() -> ApiState {
        let db = DatabasePool::in_memory().await.unwrap();
        let queries = DatabaseQueries::new(&db);
        queries.create_tables().await.unwrap();
        for (id, name, date) in [("st1", "DOE^JOHN", "20240101"), ("st2", "ROE^JANE", "20240301")] {
            queries
                .upsert_study(&NewStudy {
                    id: id.to_string(),
                    patient_name: name.to_string(),
                    patient_id: format!("P-{}", id),
                    patient_sex: "O".to_string(),
                    institution_name: "Desconocido".to_string(),
                    study_date: date.to_string(),
                    description: "RX".to_string(),
                    json_completo: format!(r#"{{"ID":"{}"}}"#, id),
                })
                .await
                .unwrap();
        }
        queries.store_cursor(42).await.unwrap();

        // 未启动的协调器，不会访问远端
        let client = OrthancClient::new(&crate::orthanc::OrthancConfig::default()).unwrap();
        let coordinator = SyncCoordinator::new(db, Arc::new(client), SyncSettings::default()).unwrap();
        ApiState::new(Arc::new(coordinator))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_api_routes(test_state().await);
        let (status, body) = get_json(app, "/api/v1/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["orthanc"], "not configured");
    }

    #[tokio::test]
    async fn test_system_stats() {
        let app = create_api_routes(test_state().await);
        let (status, body) = get_json(app, "/api/v1/system/stats").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_studies"], 2);
        assert_eq!(body["last_change_seq"], 42);
    }

    #[tokio::test]
    async fn test_list_and_search_studies() {
        let state = test_state().await;

        let (_, body) = get_json(create_api_routes(state.clone()), "/api/v1/studies").await;
        assert_eq!(body["total"], 2);
        // 按检查日期倒序
        assert_eq!(body["studies"][0]["id"], "st2");
        assert_eq!(body["studies"][0]["patientName"], "ROE^JANE");
        assert!(body["studies"][0].get("jsonCompleto").is_none());

        let (_, body) = get_json(create_api_routes(state), "/api/v1/studies?search=DOE&limit=5").await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["studies"][0]["id"], "st1");
    }

    #[tokio::test]
    async fn test_get_study() {
        let state = test_state().await;

        let (status, body) = get_json(create_api_routes(state.clone()), "/api/v1/studies/st1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "st1");
        assert_eq!(body["snapshot"]["ID"], "st1");
        assert_eq!(body["series"].as_array().map(Vec::len), Some(0));

        let (status, _) = get_json(create_api_routes(state), "/api/v1/studies/unknown").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sync_status_and_metrics() {
        let state = test_state().await;

        let (status, body) = get_json(create_api_routes(state.clone()), "/api/v1/sync/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cursor"], 42);
        assert_eq!(body["syncing"], false);

        let response = create_api_routes(state)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("pacs_change_cursor"));
    }
}
