//! 数据库查询操作

use crate::connection::DatabasePool;
use crate::models::*;
use pacs_core::utils::sanitize_search_term;
use pacs_core::{PacsError, Result};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::collections::HashSet;

/// 同步游标在 `sync_metadata` 中的键
pub const LAST_CHANGE_SEQ_KEY: &str = "last_change_seq";

const SEARCH_CLAUSE: &str =
    " WHERE patient_name LIKE ? OR patient_id LIKE ? OR description LIKE ? OR institution_name LIKE ?";
const MAX_PAGE_SIZE: i64 = 1000;
const MAX_SEARCH_LEN: usize = 100;

/// 本地缓存的记录数统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub studies: i64,
    pub series: i64,
    pub instances: i64,
}

fn write_error(e: sqlx::Error) -> PacsError {
    PacsError::StoreWrite(e.to_string())
}

/// 数据库查询操作接口
pub struct DatabaseQueries<'a> {
    pool: &'a DatabasePool,
}

impl<'a> DatabaseQueries<'a> {
    pub fn new(pool: &'a DatabasePool) -> Self {
        Self { pool }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        // 创建检查表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS studies (
                id TEXT PRIMARY KEY,
                patient_name TEXT,
                patient_id TEXT,
                patient_sex TEXT,
                institution_name TEXT,
                study_date TEXT,
                description TEXT,
                json_completo TEXT
            )
        "#).execute(pool).await?;

        // 创建系列表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS series (
                id TEXT PRIMARY KEY,
                study_id TEXT NOT NULL REFERENCES studies(id) ON DELETE CASCADE,
                series_number TEXT,
                modality TEXT,
                json_completo TEXT
            )
        "#).execute(pool).await?;

        // 创建实例表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY,
                series_id TEXT NOT NULL REFERENCES series(id) ON DELETE CASCADE,
                study_id TEXT NOT NULL REFERENCES studies(id) ON DELETE CASCADE,
                instance_number TEXT,
                json_completo TEXT
            )
        "#).execute(pool).await?;

        // 同步元数据表
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sync_metadata (
                key TEXT PRIMARY KEY,
                value TEXT
            )
        "#).execute(pool).await?;

        self.create_indexes().await?;

        tracing::info!("Database tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_studies_study_date ON studies(study_date)",
            "CREATE INDEX IF NOT EXISTS idx_studies_patient_id ON studies(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_series_study_id ON series(study_id)",
            "CREATE INDEX IF NOT EXISTS idx_instances_series_id ON instances(series_id)",
            "CREATE INDEX IF NOT EXISTS idx_instances_study_id ON instances(study_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        tracing::debug!("Database indexes created successfully");
        Ok(())
    }

    // ========== 检查相关操作 ==========

    /// 写入单个检查（存在则覆盖）
    pub async fn upsert_study(&self, study: &NewStudy) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(write_error)?;
        upsert_study_row(&mut tx, study).await.map_err(write_error)?;
        tx.commit().await.map_err(write_error)
    }

    /// 在一个事务内批量写入检查
    pub async fn bulk_upsert_studies(&self, studies: &[NewStudy]) -> Result<u64> {
        let mut tx = self.pool.pool().begin().await.map_err(write_error)?;
        for study in studies {
            upsert_study_row(&mut tx, study).await.map_err(write_error)?;
        }
        tx.commit().await.map_err(write_error)?;
        Ok(studies.len() as u64)
    }

    /// 在一个事务内批量写入系列
    pub async fn bulk_upsert_series(&self, series: &[NewSeries]) -> Result<u64> {
        let mut tx = self.pool.pool().begin().await.map_err(write_error)?;
        for s in series {
            upsert_series_row(&mut tx, s).await.map_err(write_error)?;
        }
        tx.commit().await.map_err(write_error)?;
        Ok(series.len() as u64)
    }

    /// 在一个事务内批量写入实例
    pub async fn bulk_upsert_instances(&self, instances: &[NewInstance]) -> Result<u64> {
        let mut tx = self.pool.pool().begin().await.map_err(write_error)?;
        for instance in instances {
            upsert_instance_row(&mut tx, instance).await.map_err(write_error)?;
        }
        tx.commit().await.map_err(write_error)?;
        Ok(instances.len() as u64)
    }

    /// 用远端的最新内容整体替换一个检查及其系列、实例
    ///
    /// 旧的系列（级联其实例）先被删除，远端已移除的子资源不会残留。
    pub async fn replace_study_tree(
        &self,
        study: &NewStudy,
        series: &[NewSeries],
        instances: &[NewInstance],
    ) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(write_error)?;

        upsert_study_row(&mut tx, study).await.map_err(write_error)?;

        sqlx::query("DELETE FROM series WHERE study_id = ?")
            .bind(&study.id)
            .execute(&mut *tx)
            .await
            .map_err(write_error)?;

        for s in series {
            upsert_series_row(&mut tx, s).await.map_err(write_error)?;
        }
        for instance in instances {
            upsert_instance_row(&mut tx, instance).await.map_err(write_error)?;
        }

        tx.commit().await.map_err(write_error)
    }

    /// 删除检查，系列与实例经外键级联删除
    pub async fn delete_study(&self, study_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM studies WHERE id = ?")
            .bind(study_id)
            .execute(self.pool.pool())
            .await
            .map_err(write_error)?;

        Ok(result.rows_affected() > 0)
    }

    /// 删除不在 `keep` 中的本地检查，返回删除数量
    pub async fn prune_studies(&self, keep: &HashSet<String>) -> Result<u64> {
        let mut tx = self.pool.pool().begin().await.map_err(write_error)?;

        let local_ids: Vec<String> = sqlx::query_scalar("SELECT id FROM studies")
            .fetch_all(&mut *tx)
            .await?;

        let mut removed = 0;
        for id in local_ids.iter().filter(|id| !keep.contains(*id)) {
            removed += sqlx::query("DELETE FROM studies WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(write_error)?
                .rows_affected();
        }

        tx.commit().await.map_err(write_error)?;
        Ok(removed)
    }

    /// 检查是否已缓存
    pub async fn study_exists(&self, study_id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM studies WHERE id = ?")
            .bind(study_id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(found.is_some())
    }

    /// 根据ID查找检查
    pub async fn get_study_by_id(&self, study_id: &str) -> Result<Option<DbStudy>> {
        let result = sqlx::query_as::<_, DbStudy>("SELECT * FROM studies WHERE id = ?")
            .bind(study_id)
            .fetch_optional(self.pool.pool())
            .await?;

        Ok(result)
    }

    /// 读取检查的原始快照
    pub async fn get_study_snapshot(&self, study_id: &str) -> Result<Option<serde_json::Value>> {
        let json: Option<Option<String>> =
            sqlx::query_scalar("SELECT json_completo FROM studies WHERE id = ?")
                .bind(study_id)
                .fetch_optional(self.pool.pool())
                .await?;

        match json.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// 分页列出检查，按检查日期倒序，可按患者姓名/ID、描述、机构搜索
    pub async fn list_studies(&self, limit: i64, offset: i64, search: &str) -> Result<Vec<DbStudy>> {
        let search = sanitize_search_term(search, MAX_SEARCH_LEN);
        let mut sql = String::from("SELECT * FROM studies");
        if !search.is_empty() {
            sql.push_str(SEARCH_CLAUSE);
        }
        sql.push_str(" ORDER BY study_date DESC, id LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, DbStudy>(&sql);
        if !search.is_empty() {
            let like = format!("%{}%", search);
            for _ in 0..4 {
                query = query.bind(like.clone());
            }
        }

        let results = query
            .bind(limit.clamp(1, MAX_PAGE_SIZE))
            .bind(offset.max(0))
            .fetch_all(self.pool.pool())
            .await?;

        Ok(results)
    }

    /// 统计检查数量，搜索条件与 `list_studies` 相同
    pub async fn count_studies(&self, search: &str) -> Result<i64> {
        let search = sanitize_search_term(search, MAX_SEARCH_LEN);
        let mut sql = String::from("SELECT COUNT(*) FROM studies");
        if !search.is_empty() {
            sql.push_str(SEARCH_CLAUSE);
        }

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if !search.is_empty() {
            let like = format!("%{}%", search);
            for _ in 0..4 {
                query = query.bind(like.clone());
            }
        }

        Ok(query.fetch_one(self.pool.pool()).await?)
    }

    // ========== 系列与实例 ==========

    /// 根据检查ID获取所有系列
    pub async fn get_series_by_study_id(&self, study_id: &str) -> Result<Vec<DbSeries>> {
        let results = sqlx::query_as::<_, DbSeries>(
            "SELECT * FROM series WHERE study_id = ? ORDER BY CAST(series_number AS INTEGER), id",
        )
        .bind(study_id)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(results)
    }

    /// 根据系列ID获取所有实例
    pub async fn get_instances_by_series_id(&self, series_id: &str) -> Result<Vec<DbInstance>> {
        let results = sqlx::query_as::<_, DbInstance>(
            "SELECT * FROM instances WHERE series_id = ? ORDER BY CAST(instance_number AS INTEGER), id",
        )
        .bind(series_id)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(results)
    }

    /// 缓存记录数统计
    pub async fn cache_stats(&self) -> Result<CacheStats> {
        let pool = self.pool.pool();
        let studies = sqlx::query_scalar("SELECT COUNT(*) FROM studies").fetch_one(pool).await?;
        let series = sqlx::query_scalar("SELECT COUNT(*) FROM series").fetch_one(pool).await?;
        let instances = sqlx::query_scalar("SELECT COUNT(*) FROM instances").fetch_one(pool).await?;

        Ok(CacheStats { studies, series, instances })
    }

    // ========== 同步元数据 ==========

    /// 读取元数据
    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM sync_metadata WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool.pool())
                .await?;

        Ok(value.flatten())
    }

    /// 写入元数据
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(r#"
            INSERT INTO sync_metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#)
        .bind(key)
        .bind(value)
        .execute(self.pool.pool())
        .await
        .map_err(write_error)?;

        Ok(())
    }

    /// 读取持久化的同步游标，未写入过时为 `None`
    pub async fn get_cursor(&self) -> Result<Option<i64>> {
        match self.get_metadata(LAST_CHANGE_SEQ_KEY).await? {
            Some(value) => match value.trim().parse::<i64>() {
                Ok(seq) => Ok(Some(seq)),
                Err(_) => {
                    tracing::warn!("Ignoring malformed sync cursor value: {:?}", value);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// 无条件写入同步游标（全量同步使用）
    pub async fn store_cursor(&self, seq: i64) -> Result<()> {
        self.set_metadata(LAST_CHANGE_SEQ_KEY, &seq.to_string()).await
    }

    /// 仅当 `seq` 严格大于已持久化的值时写入，返回是否写入
    pub async fn advance_cursor(&self, seq: i64) -> Result<bool> {
        let result = sqlx::query(r#"
            INSERT INTO sync_metadata (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            WHERE sync_metadata.value IS NULL
               OR CAST(sync_metadata.value AS INTEGER) < CAST(excluded.value AS INTEGER)
        "#)
        .bind(LAST_CHANGE_SEQ_KEY)
        .bind(seq.to_string())
        .execute(self.pool.pool())
        .await
        .map_err(write_error)?;

        Ok(result.rows_affected() > 0)
    }
}

async fn upsert_study_row(conn: &mut SqliteConnection, study: &NewStudy) -> sqlx::Result<()> {
    sqlx::query(r#"
        INSERT INTO studies (id, patient_name, patient_id, patient_sex, institution_name, study_date, description, json_completo)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            patient_name = excluded.patient_name,
            patient_id = excluded.patient_id,
            patient_sex = excluded.patient_sex,
            institution_name = excluded.institution_name,
            study_date = excluded.study_date,
            description = excluded.description,
            json_completo = excluded.json_completo
    "#)
    .bind(&study.id)
    .bind(&study.patient_name)
    .bind(&study.patient_id)
    .bind(&study.patient_sex)
    .bind(&study.institution_name)
    .bind(&study.study_date)
    .bind(&study.description)
    .bind(&study.json_completo)
    .execute(conn)
    .await?;

    Ok(())
}

async fn upsert_series_row(conn: &mut SqliteConnection, series: &NewSeries) -> sqlx::Result<()> {
    sqlx::query(r#"
        INSERT INTO series (id, study_id, series_number, modality, json_completo)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            study_id = excluded.study_id,
            series_number = excluded.series_number,
            modality = excluded.modality,
            json_completo = excluded.json_completo
    "#)
    .bind(&series.id)
    .bind(&series.study_id)
    .bind(&series.series_number)
    .bind(&series.modality)
    .bind(&series.json_completo)
    .execute(conn)
    .await?;

    Ok(())
}

async fn upsert_instance_row(conn: &mut SqliteConnection, instance: &NewInstance) -> sqlx::Result<()> {
    sqlx::query(r#"
        INSERT INTO instances (id, series_id, study_id, instance_number, json_completo)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            series_id = excluded.series_id,
            study_id = excluded.study_id,
            instance_number = excluded.instance_number,
            json_completo = excluded.json_completo
    "#)
    .bind(&instance.id)
    .bind(&instance.series_id)
    .bind(&instance.study_id)
    .bind(&instance.instance_number)
    .bind(&instance.json_completo)
    .execute(conn)
    .await?;

    Ok(())
}
