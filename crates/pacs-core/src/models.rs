//! 核心数据模型定义
//!
//! 远端PACS（Orthanc）的变更日志与资源表示。资源保留完整的原始JSON，
//! 以便本地缓存无损保存快照。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 变更日志事件类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChangeType {
    NewStudy,
    StableStudy,
    DeletedStudy,
    Other(String),
}

impl ChangeType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NewStudy => "NewStudy",
            Self::StableStudy => "StableStudy",
            Self::DeletedStudy => "DeletedStudy",
            Self::Other(name) => name,
        }
    }

    /// 检查新建或已稳定，需要拉取详情并写入缓存
    pub fn is_study_upsert(&self) -> bool {
        matches!(self, Self::NewStudy | Self::StableStudy)
    }
}

impl From<String> for ChangeType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "NewStudy" => Self::NewStudy,
            "StableStudy" => Self::StableStudy,
            "DeletedStudy" => Self::DeletedStudy,
            _ => Self::Other(value),
        }
    }
}

impl From<ChangeType> for String {
    fn from(value: ChangeType) -> Self {
        value.as_str().to_string()
    }
}

/// 变更日志中的单条事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeEvent {
    pub seq: i64,
    pub change_type: ChangeType,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

impl ChangeEvent {
    pub fn new(seq: i64, change_type: ChangeType, id: impl Into<String>) -> Self {
        Self {
            seq,
            change_type,
            id: id.into(),
            resource_type: None,
            date: None,
        }
    }
}

/// `/changes` 的一页结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangesPage {
    #[serde(default)]
    pub changes: Vec<ChangeEvent>,
    /// 远端已知的最大序号
    pub last: i64,
    #[serde(default)]
    pub done: bool,
}

/// 主DICOM标签字典
///
/// 标签值通常是字符串，序列等复杂值按原样保留。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DicomTags(pub BTreeMap<String, Value>);

impl DicomTags {
    /// 读取字符串标签，空字符串视为缺失
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// 远端检查资源
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StudyResource {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub series: Vec<String>,
    #[serde(default)]
    pub main_dicom_tags: DicomTags,
    #[serde(default)]
    pub patient_main_dicom_tags: DicomTags,
    /// 完整的原始JSON快照
    #[serde(skip)]
    pub raw: Value,
}

/// 远端系列资源
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SeriesResource {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub parent_study: String,
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default)]
    pub main_dicom_tags: DicomTags,
    #[serde(skip)]
    pub raw: Value,
}

/// 远端实例资源
///
/// 展开后的实例只带 `ParentSeries`，所属检查由调用方补全。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceResource {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub parent_series: String,
    #[serde(default)]
    pub parent_study: Option<String>,
    #[serde(default)]
    pub main_dicom_tags: DicomTags,
    #[serde(skip)]
    pub raw: Value,
}

/// 从原始JSON构造资源并保留快照
pub trait RemoteResource: Sized {
    fn from_value(value: Value) -> crate::Result<Self>;
}

macro_rules! impl_remote_resource {
    ($($ty:ty),*) => {
        $(
            impl RemoteResource for $ty {
                fn from_value(value: Value) -> crate::Result<Self> {
                    let mut resource: $ty = serde_json::from_value(value.clone())?;
                    resource.raw = value;
                    Ok(resource)
                }
            }
        )*
    };
}

impl_remote_resource!(StudyResource, SeriesResource, InstanceResource);
