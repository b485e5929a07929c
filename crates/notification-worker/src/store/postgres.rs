//! PostgreSQL 存储
//!
//! 每个逻辑集合一张表，列名为 snake_case，JSON 列映射队列记录的 data。

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classroom_shared::config::DatabaseConfig;
use classroom_shared::error::ClassroomError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::{info, instrument};

use super::traits::{
    ClassRepository, DeliveryFailure, QueueRepository, TaskRepository, UserRepository,
};
use crate::error::Result;
use crate::models::{ClassRecord, QueueEntry, TaskRecord, UserRecord};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    batch_limit: usize,
}

impl PgStore {
    pub fn new(pool: PgPool, batch_limit: usize) -> Self {
        Self {
            pool,
            batch_limit: batch_limit.max(1),
        }
    }

    /// 建立连接池并执行迁移
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig, batch_limit: usize) -> Result<Self> {
        info!("正在连接数据库...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| ClassroomError::Internal(format!("数据库迁移失败: {e}")))?;

        info!("数据库连接池已创建，迁移完成");

        Ok(Self::new(pool, batch_limit))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

#[derive(sqlx::FromRow)]
struct QueueRow {
    id: String,
    title: String,
    body: String,
    data: Json<BTreeMap<String, serde_json::Value>>,
    fcm_token: Option<String>,
    sent: bool,
    sent_at: Option<DateTime<Utc>>,
    message_id: Option<String>,
    error: Option<String>,
    error_code: Option<String>,
    error_details: Option<String>,
    error_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<QueueRow> for QueueEntry {
    fn from(row: QueueRow) -> Self {
        Self {
            id: row.id,
            title: row.title,
            body: row.body,
            data: row.data.0,
            target_token: row.fcm_token,
            sent: row.sent,
            sent_at: row.sent_at,
            message_id: row.message_id,
            error: row.error,
            error_code: row.error_code,
            error_details: row.error_details,
            error_at: row.error_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ClassRow {
    id: String,
    name: String,
    student_ids: Vec<String>,
    admin_ids: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    fcm_token: Option<String>,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    class_id: String,
    title: String,
    due_date: Option<DateTime<Utc>>,
    is_completed: bool,
}

#[async_trait]
impl QueueRepository for PgStore {
    async fn get_queue_entry(&self, id: &str) -> Result<Option<QueueEntry>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT id, title, body, data, fcm_token, sent, sent_at, message_id,
                   error, error_code, error_details, error_at, created_at
            FROM notifications_queue
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(QueueEntry::from))
    }

    #[instrument(skip(self))]
    async fn mark_sent(&self, id: &str, message_id: &str, sent_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications_queue
            SET sent = TRUE, sent_at = $2, message_id = $3,
                error = NULL, error_code = NULL, error_details = NULL, error_at = NULL
            WHERE id = $1 AND sent = FALSE
            "#,
        )
        .bind(id)
        .bind(sent_at)
        .bind(message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, failure), fields(code = %failure.code))]
    async fn mark_failed(
        &self,
        id: &str,
        failure: &DeliveryFailure,
        failed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications_queue
            SET error = $2, error_code = $3, error_details = $4, error_at = $5
            WHERE id = $1 AND sent = FALSE
            "#,
        )
        .bind(id)
        .bind(&failure.message)
        .bind(&failure.code)
        .bind(failure.details.as_deref())
        .bind(failed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM notifications_queue
            WHERE sent = TRUE AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ClassRepository for PgStore {
    async fn get_class(&self, id: &str) -> Result<Option<ClassRecord>> {
        let row = sqlx::query_as::<_, ClassRow>(
            r#"
            SELECT id, name, student_ids, admin_ids
            FROM classes
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ClassRecord {
            id: r.id,
            name: r.name,
            student_ids: r.student_ids,
            admin_ids: r.admin_ids,
        }))
    }
}

#[async_trait]
impl UserRepository for PgStore {
    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT id, fcm_token FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| UserRecord {
            id: r.id,
            fcm_token: r.fcm_token,
        }))
    }

    async fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<UserRecord>> {
        if ids.len() > self.batch_limit {
            return Err(ClassroomError::Validation(format!(
                "单次查询最多 {} 个用户 ID，实际 {}",
                self.batch_limit,
                ids.len()
            ))
            .into());
        }

        let rows = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, fcm_token
            FROM users
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| UserRecord {
                id: r.id,
                fcm_token: r.fcm_token,
            })
            .collect())
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}

#[async_trait]
impl TaskRepository for PgStore {
    #[instrument(skip(self))]
    async fn find_due_tasks(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, class_id, title, due_date, is_completed
            FROM tasks
            WHERE due_date >= $1 AND due_date < $2 AND is_completed = FALSE
            ORDER BY due_date
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| TaskRecord {
                id: r.id,
                class_id: r.class_id,
                title: r.title,
                due_date: r.due_date,
                is_completed: r.is_completed,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn connect() -> PgStore {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| DatabaseConfig::default().url),
            ..DatabaseConfig::default()
        };
        PgStore::connect(&config, 30).await.unwrap()
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_mark_sent_only_once() {
        let store = connect().await;
        let id = format!("q-{}", uuid::Uuid::now_v7());
        sqlx::query("INSERT INTO notifications_queue (id, title, body, fcm_token) VALUES ($1, 'T', 'B', 'tok')")
            .bind(&id)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(store.mark_sent(&id, "m-1", Utc::now()).await.unwrap());
        assert!(!store.mark_sent(&id, "m-2", Utc::now()).await.unwrap());

        let entry = store.get_queue_entry(&id).await.unwrap().unwrap();
        assert_eq!(entry.message_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_retention_keeps_failed_entries() {
        let store = connect().await;
        let old = Utc::now() - ChronoDuration::days(8);
        let sent_id = format!("q-{}", uuid::Uuid::now_v7());
        let failed_id = format!("q-{}", uuid::Uuid::now_v7());

        sqlx::query(
            "INSERT INTO notifications_queue (id, title, body, sent, created_at) VALUES ($1, 'T', 'B', TRUE, $3), ($2, 'T', 'B', FALSE, $3)",
        )
        .bind(&sent_id)
        .bind(&failed_id)
        .bind(old)
        .execute(store.pool())
        .await
        .unwrap();

        let deleted = store
            .delete_sent_before(Utc::now() - ChronoDuration::days(7))
            .await
            .unwrap();
        assert!(deleted >= 1);
        assert!(store.get_queue_entry(&sent_id).await.unwrap().is_none());
        assert!(store.get_queue_entry(&failed_id).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_batch_limit_enforced() {
        let store = connect().await;
        let ids: Vec<String> = (0..31).map(|i| format!("u{i}")).collect();
        assert!(store.get_users_by_ids(&ids).await.is_err());
    }
}
