//! 测试用的内存变更源

use crate::source::{ChangeSource, END_OF_LOG_SINCE};
use async_trait::async_trait;
use pacs_core::{
    ChangeEvent, ChangeType, ChangesPage, InstanceResource, PacsError, RemoteResource, Result,
    SeriesResource, StudyResource,
};
use pacs_database::{DatabasePool, DatabaseQueries};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct Remote {
    studies: BTreeMap<String, Value>,
    series: BTreeMap<String, Value>,
    instances: BTreeMap<String, Value>,
    changes: Vec<ChangeEvent>,
    last: i64,
    offline: bool,
    failing: HashMap<String, u16>,
    since_requests: Vec<i64>,
    study_fetches: Vec<String>,
}

/// 模拟的远端PACS
#[derive(Default)]
pub struct FakeSource {
    remote: Mutex<Remote>,
}

fn http_error(status: u16, url: &str) -> PacsError {
    PacsError::RemoteHttp { status, url: url.to_string() }
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_study(&self, id: &str, patient: &str) {
        self.remote.lock().unwrap().studies.insert(
            id.to_string(),
            json!({
                "ID": id,
                "MainDicomTags": {"StudyDate": "20240115", "StudyDescription": format!("Study {}", id)},
                "PatientMainDicomTags": {"PatientName": patient, "PatientID": format!("P-{}", id)}
            }),
        );
    }

    pub fn add_series(&self, id: &str, study_id: &str) {
        self.remote.lock().unwrap().series.insert(
            id.to_string(),
            json!({"ID": id, "ParentStudy": study_id, "MainDicomTags": {"Modality": "CT", "SeriesNumber": "1"}}),
        );
    }

    pub fn add_instance(&self, id: &str, series_id: &str) {
        self.remote.lock().unwrap().instances.insert(
            id.to_string(),
            json!({"ID": id, "ParentSeries": series_id, "MainDicomTags": {"InstanceNumber": "1"}}),
        );
    }

    /// 删除检查及其子资源
    pub fn remove_study(&self, id: &str) {
        let mut remote = self.remote.lock().unwrap();
        remote.studies.remove(id);
        let series: Vec<String> = remote
            .series
            .iter()
            .filter(|(_, v)| v["ParentStudy"] == id)
            .map(|(k, _)| k.clone())
            .collect();
        for s in &series {
            remote.series.remove(s);
        }
        remote.instances.retain(|_, v| {
            !series.iter().any(|s| v["ParentSeries"] == s.as_str())
        });
    }

    pub fn push_change(&self, seq: i64, change_type: ChangeType, id: &str) {
        let mut remote = self.remote.lock().unwrap();
        remote.changes.push(ChangeEvent::new(seq, change_type, id));
        remote.last = remote.last.max(seq);
    }

    pub fn set_last(&self, last: i64) {
        self.remote.lock().unwrap().last = last;
    }

    pub fn set_offline(&self, offline: bool) {
        self.remote.lock().unwrap().offline = offline;
    }

    /// 让某个检查的详情请求返回指定状态码
    pub fn fail_study(&self, id: &str, status: u16) {
        self.remote.lock().unwrap().failing.insert(id.to_string(), status);
    }

    pub fn heal_study(&self, id: &str) {
        self.remote.lock().unwrap().failing.remove(id);
    }

    pub fn since_requests(&self) -> Vec<i64> {
        self.remote.lock().unwrap().since_requests.clone()
    }

    pub fn study_fetches(&self) -> Vec<String> {
        self.remote.lock().unwrap().study_fetches.clone()
    }

    fn check_online(&self) -> Result<()> {
        if self.remote.lock().unwrap().offline {
            return Err(PacsError::RemoteUnavailable("connect ECONNREFUSED 127.0.0.1:8042".to_string()));
        }
        Ok(())
    }

    fn series_of(remote: &Remote, study_id: &str) -> Vec<Value> {
        remote
            .series
            .values()
            .filter(|v| v["ParentStudy"] == study_id)
            .cloned()
            .collect()
    }
}

fn parse_all<T: RemoteResource>(values: impl IntoIterator<Item = Value>) -> Result<Vec<T>> {
    values.into_iter().map(T::from_value).collect()
}

#[async_trait]
impl ChangeSource for FakeSource {
    async fn changes(&self, since: i64, limit: u32) -> Result<ChangesPage> {
        self.check_online()?;
        let mut remote = self.remote.lock().unwrap();
        if since != END_OF_LOG_SINCE {
            remote.since_requests.push(since);
        }

        let mut changes: Vec<ChangeEvent> =
            remote.changes.iter().filter(|c| c.seq > since).cloned().collect();
        changes.sort_by_key(|c| c.seq);
        let done = changes.len() <= limit as usize;
        changes.truncate(limit as usize);

        Ok(ChangesPage { changes, last: remote.last, done })
    }

    async fn study(&self, study_id: &str) -> Result<StudyResource> {
        self.check_online()?;
        let value = {
            let mut remote = self.remote.lock().unwrap();
            remote.study_fetches.push(study_id.to_string());
            if let Some(status) = remote.failing.get(study_id) {
                return Err(http_error(*status, study_id));
            }
            remote.studies.get(study_id).cloned()
        };
        match value {
            Some(value) => StudyResource::from_value(value),
            None => Err(http_error(404, study_id)),
        }
    }

    async fn study_series(&self, study_id: &str) -> Result<Vec<SeriesResource>> {
        self.check_online()?;
        let values = {
            let remote = self.remote.lock().unwrap();
            if !remote.studies.contains_key(study_id) {
                return Err(http_error(404, study_id));
            }
            Self::series_of(&remote, study_id)
        };
        parse_all(values)
    }

    async fn study_instances(&self, study_id: &str) -> Result<Vec<InstanceResource>> {
        self.check_online()?;
        let values: Vec<Value> = {
            let remote = self.remote.lock().unwrap();
            if !remote.studies.contains_key(study_id) {
                return Err(http_error(404, study_id));
            }
            let series: Vec<Value> = Self::series_of(&remote, study_id)
                .into_iter()
                .map(|v| v["ID"].clone())
                .collect();
            remote
                .instances
                .values()
                .filter(|v| series.contains(&v["ParentSeries"]))
                .cloned()
                .collect()
        };
        parse_all(values)
    }

    async fn all_studies(&self) -> Result<Vec<StudyResource>> {
        self.check_online()?;
        let values: Vec<Value> = self.remote.lock().unwrap().studies.values().cloned().collect();
        parse_all(values)
    }

    async fn all_series(&self) -> Result<Vec<SeriesResource>> {
        self.check_online()?;
        let values: Vec<Value> = self.remote.lock().unwrap().series.values().cloned().collect();
        parse_all(values)
    }

    async fn all_instances(&self) -> Result<Vec<InstanceResource>> {
        self.check_online()?;
        let values: Vec<Value> = self.remote.lock().unwrap().instances.values().cloned().collect();
        parse_all(values)
    }
}

/// 建好表的内存数据库
pub async fn test_database() -> DatabasePool {
    let db = DatabasePool::in_memory().await.unwrap();
    DatabaseQueries::new(&db).create_tables().await.unwrap();
    db
}
