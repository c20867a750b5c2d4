//! 远端变更源接口
//!
//! 同步引擎只通过这个接口访问远端PACS，Orthanc客户端是其生产实现。

use async_trait::async_trait;
use pacs_core::{ChangesPage, InstanceResource, Result, SeriesResource, StudyResource};

/// 查询远端最大序号时使用的游标，远端只会返回 `Last`
pub const END_OF_LOG_SINCE: i64 = 1_000_000_000_000_000;

/// 远端变更源
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// 获取序号大于 `since` 的变更，最多 `limit` 条，按序号升序
    async fn changes(&self, since: i64, limit: u32) -> Result<ChangesPage>;

    /// 远端当前的最大变更序号
    async fn last_change_seq(&self) -> Result<i64> {
        Ok(self.changes(END_OF_LOG_SINCE, 1).await?.last)
    }

    /// 获取单个检查详情
    async fn study(&self, study_id: &str) -> Result<StudyResource>;

    /// 获取检查下的所有系列
    async fn study_series(&self, study_id: &str) -> Result<Vec<SeriesResource>>;

    /// 获取检查下的所有实例
    async fn study_instances(&self, study_id: &str) -> Result<Vec<InstanceResource>>;

    /// 批量获取所有检查（展开主标签）
    async fn all_studies(&self) -> Result<Vec<StudyResource>>;

    /// 批量获取所有系列
    async fn all_series(&self) -> Result<Vec<SeriesResource>>;

    /// 批量获取所有实例
    async fn all_instances(&self) -> Result<Vec<InstanceResource>>;
}
