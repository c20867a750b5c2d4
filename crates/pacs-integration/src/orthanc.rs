//! Orthanc REST客户端
//!
//! 实现 [`ChangeSource`]，为同步引擎提供变更日志和资源详情。
//! 网络层错误映射为 `RemoteUnavailable`，非2xx状态码映射为 `RemoteHttp`。

use async_trait::async_trait;
use pacs_core::{
    ChangesPage, InstanceResource, PacsError, RemoteResource, Result, SeriesResource, StudyResource,
};
use pacs_sync::ChangeSource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Orthanc连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrthancConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// 单个请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for OrthancConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8042".to_string(),
            username: "orthanc".to_string(),
            password: String::new(),
            request_timeout_secs: 30,
        }
    }
}

/// Orthanc客户端
#[derive(Debug, Clone)]
pub struct OrthancClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl OrthancClient {
    pub fn new(config: &OrthancConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| PacsError::Config(format!("无法创建HTTP客户端: {}", e)))?;

        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 检查Orthanc是否可达，返回 `/system` 信息
    pub async fn check_connection(&self) -> Result<Value> {
        let system: Value = self.get_json("/system", &[]).await?;
        debug!(
            "Connected to Orthanc {} at {}",
            system["Version"].as_str().unwrap_or("unknown"),
            self.base_url
        );
        Ok(system)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        if self.username.is_empty() {
            request
        } else {
            request.basic_auth(&self.username, Some(&self.password))
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .request(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| PacsError::RemoteUnavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PacsError::RemoteHttp { status: status.as_u16(), url });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PacsError::RemoteUnavailable(format!("{}: {}", url, e)))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_resources<T: RemoteResource>(&self, path: &str, expand: bool) -> Result<Vec<T>> {
        let query = if expand {
            vec![("expand", "true".to_string())]
        } else {
            Vec::new()
        };
        let values: Vec<Value> = self.get_json(path, &query).await?;
        values.into_iter().map(T::from_value).collect()
    }
}

#[async_trait]
impl ChangeSource for OrthancClient {
    async fn changes(&self, since: i64, limit: u32) -> Result<ChangesPage> {
        self.get_json(
            "/changes",
            &[("since", since.to_string()), ("limit", limit.to_string())],
        )
        .await
    }

    async fn study(&self, study_id: &str) -> Result<StudyResource> {
        let value: Value = self.get_json(&format!("/studies/{}", study_id), &[]).await?;
        StudyResource::from_value(value)
    }

    async fn study_series(&self, study_id: &str) -> Result<Vec<SeriesResource>> {
        self.get_resources(&format!("/studies/{}/series", study_id), false).await
    }

    async fn study_instances(&self, study_id: &str) -> Result<Vec<InstanceResource>> {
        self.get_resources(&format!("/studies/{}/instances", study_id), false).await
    }

    async fn all_studies(&self) -> Result<Vec<StudyResource>> {
        self.get_resources("/studies", true).await
    }

    async fn all_series(&self) -> Result<Vec<SeriesResource>> {
        self.get_resources("/series", true).await
    }

    async fn all_instances(&self) -> Result<Vec<InstanceResource>> {
        self.get_resources("/instances", true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    /// 在本地端口上启动一个模拟的Orthanc
    async fn spawn_orthanc() -> String {
        async fn changes(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
            let since: i64 = params.get("since").and_then(|s| s.parse().ok()).unwrap_or(0);
            if since >= 7 {
                return Json(json!({"Changes": [], "Done": true, "Last": 7}));
            }
            Json(json!({
                "Changes": [
                    {"Seq": 6, "ChangeType": "NewStudy", "ID": "st1", "ResourceType": "Study", "Date": "20240101T000000"},
                    {"Seq": 7, "ChangeType": "StableSeries", "ID": "se1", "ResourceType": "Series", "Date": "20240101T000001"}
                ],
                "Done": true,
                "Last": 7
            }))
        }

        async fn studies(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
            if params.contains_key("expand") {
                Json(json!([{"ID": "st1", "MainDicomTags": {"StudyDate": "20240101"}, "PatientMainDicomTags": {}}]))
            } else {
                Json(json!(["st1"]))
            }
        }

        async fn system(headers: HeaderMap) -> std::result::Result<Json<Value>, StatusCode> {
            // "orthanc:secret"
            match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                Some("Basic b3J0aGFuYzpzZWNyZXQ=") => Ok(Json(json!({"Version": "1.12.1"}))),
                _ => Err(StatusCode::UNAUTHORIZED),
            }
        }

        let app = Router::new()
            .route("/changes", get(changes))
            .route("/studies", get(studies))
            .route("/studies/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/studies/st1/instances",
                get(|| async { Json(json!([{"ID": "in1", "ParentSeries": "se1", "MainDicomTags": {}}])) }),
            )
            .route("/system", get(system));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    fn client(url: String, password: &str) -> OrthancClient {
        OrthancClient::new(&OrthancConfig {
            url,
            password: password.to_string(),
            request_timeout_secs: 5,
            ..OrthancConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_changes_and_last_seq() {
        let client = client(spawn_orthanc().await, "secret");

        let page = client.changes(0, 100).await.unwrap();
        assert_eq!(page.changes.len(), 2);
        assert_eq!(page.changes[0].seq, 6);
        assert_eq!(page.last, 7);

        assert_eq!(client.last_change_seq().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_expanded_resources() {
        let client = client(spawn_orthanc().await, "secret");

        let studies = client.all_studies().await.unwrap();
        assert_eq!(studies.len(), 1);
        assert_eq!(studies[0].main_dicom_tags.get("StudyDate"), Some("20240101"));

        let instances = client.study_instances("st1").await.unwrap();
        assert_eq!(instances[0].parent_series, "se1");
    }

    #[tokio::test]
    async fn test_http_errors_are_mapped() {
        let client = client(spawn_orthanc().await, "wrong");

        let err = client.study("missing").await.unwrap_err();
        assert!(err.is_remote_not_found());
        assert!(!err.is_transient());

        let err = client.check_connection().await.unwrap_err();
        assert!(matches!(err, PacsError::RemoteHttp { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_basic_auth() {
        let client = client(spawn_orthanc().await, "secret");
        let system = client.check_connection().await.unwrap();
        assert_eq!(system["Version"], "1.12.1");
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client(format!("http://{}", addr), "");
        let err = client.changes(0, 100).await.unwrap_err();
        assert!(matches!(err, PacsError::RemoteUnavailable(_)));
        assert!(err.is_transient());
    }
}
