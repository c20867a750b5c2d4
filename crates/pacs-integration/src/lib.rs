//! # PACS集成模块
//!
//! 与外部系统的接口：
//! - Orthanc REST客户端，作为同步引擎的变更源
//! - 管理用RESTful API：健康检查、同步状态、手动同步、缓存查询和Prometheus指标

pub mod api;
pub mod orthanc;

pub use api::{create_api_routes, ApiServer, ApiState, SystemStatsResponse};
pub use orthanc::{OrthancClient, OrthancConfig};
