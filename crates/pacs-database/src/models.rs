//! 数据库模型
//!
//! 结构化列是可查询的投影，`json_completo` 保存远端原始快照。
//! 每次写入都从同一份远端载荷重新生成投影。

use pacs_core::utils::{is_valid_dicom_date, truncate_chars};
use pacs_core::{InstanceResource, Result, SeriesResource, StudyResource};
use serde::Serialize;
use sqlx::FromRow;

const MAX_NAME_LEN: usize = 255;
const MAX_PATIENT_ID_LEN: usize = 64;
const MAX_SEX_LEN: usize = 10;
const MAX_DATE_LEN: usize = 10;

// 管理界面按这些占位值筛选缺失字段
const UNNAMED_PATIENT: &str = "Sin Nombre";
const UNNUMBERED_PATIENT: &str = "S/N";
const UNKNOWN_INSTITUTION: &str = "Desconocido";

// 数据库表模型 - 使用FromRow trait用于SQL查询

/// 数据库检查表
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStudy {
    pub id: String,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub patient_sex: Option<String>,
    pub institution_name: Option<String>,
    pub study_date: Option<String>,
    pub description: Option<String>,
    #[serde(skip_serializing)]
    pub json_completo: Option<String>,
}

/// 数据库系列表
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSeries {
    pub id: String,
    pub study_id: String,
    pub series_number: Option<String>,
    pub modality: Option<String>,
    #[serde(skip_serializing)]
    pub json_completo: Option<String>,
}

/// 数据库实例表
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbInstance {
    pub id: String,
    pub series_id: String,
    pub study_id: String,
    pub instance_number: Option<String>,
    #[serde(skip_serializing)]
    pub json_completo: Option<String>,
}

// 写入模型 - 由远端资源投影得到

/// 检查写入模型
#[derive(Debug, Clone, PartialEq)]
pub struct NewStudy {
    pub id: String,
    pub patient_name: String,
    pub patient_id: String,
    pub patient_sex: String,
    pub institution_name: String,
    pub study_date: String,
    pub description: String,
    pub json_completo: String,
}

impl NewStudy {
    pub fn from_resource(study: &StudyResource) -> Result<Self> {
        let patient = &study.patient_main_dicom_tags;
        let tags = &study.main_dicom_tags;

        let study_date = truncate_chars(tags.get("StudyDate").unwrap_or(""), MAX_DATE_LEN);
        if !study_date.is_empty() && !is_valid_dicom_date(&study_date) {
            tracing::debug!("Study {} has non-standard StudyDate: {}", study.id, study_date);
        }

        let description = tags
            .get("StudyDescription")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| tags.get("StudyID"))
            .unwrap_or("RX");

        Ok(Self {
            id: study.id.clone(),
            patient_name: truncate_chars(patient.get("PatientName").unwrap_or(UNNAMED_PATIENT), MAX_NAME_LEN),
            patient_id: truncate_chars(patient.get("PatientID").unwrap_or(UNNUMBERED_PATIENT), MAX_PATIENT_ID_LEN),
            patient_sex: truncate_chars(patient.get("PatientSex").unwrap_or("O"), MAX_SEX_LEN),
            institution_name: truncate_chars(tags.get("InstitutionName").unwrap_or(UNKNOWN_INSTITUTION), MAX_NAME_LEN),
            study_date,
            description: truncate_chars(description, MAX_NAME_LEN),
            json_completo: serde_json::to_string(&study.raw)?,
        })
    }
}

/// 系列写入模型
#[derive(Debug, Clone, PartialEq)]
pub struct NewSeries {
    pub id: String,
    pub study_id: String,
    pub series_number: String,
    pub modality: String,
    pub json_completo: String,
}

impl NewSeries {
    pub fn from_resource(series: &SeriesResource, study_id: &str) -> Result<Self> {
        Ok(Self {
            id: series.id.clone(),
            study_id: study_id.to_string(),
            series_number: series.main_dicom_tags.get("SeriesNumber").unwrap_or("").to_string(),
            modality: series.main_dicom_tags.get("Modality").unwrap_or("").to_string(),
            json_completo: serde_json::to_string(&series.raw)?,
        })
    }
}

/// 实例写入模型
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub id: String,
    pub series_id: String,
    pub study_id: String,
    pub instance_number: String,
    pub json_completo: String,
}

impl NewInstance {
    pub fn from_resource(instance: &InstanceResource, study_id: &str) -> Result<Self> {
        Ok(Self {
            id: instance.id.clone(),
            series_id: instance.parent_series.clone(),
            study_id: study_id.to_string(),
            instance_number: instance.main_dicom_tags.get("InstanceNumber").unwrap_or("").to_string(),
            json_completo: serde_json::to_string(&instance.raw)?,
        })
    }
}
