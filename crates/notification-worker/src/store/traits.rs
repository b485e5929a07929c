//! 仓储 Trait 定义
//!
//! 按逻辑集合划分：队列、班级、用户、任务。写操作只限于单条队列记录的字段更新
//! 和已发送记录的批量删除。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{ClassRecord, QueueEntry, TaskRecord, UserRecord};

/// 投递失败时写回队列记录的错误信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub message: String,
    /// 错误分类（DeliveryErrorKind 的字符串形式）
    pub code: String,
    /// 网关原始错误码或状态文本
    pub details: Option<String>,
}

/// 通知队列仓储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn get_queue_entry(&self, id: &str) -> Result<Option<QueueEntry>>;

    /// 标记为已发送并清空错误字段
    ///
    /// 仅当记录仍为 sent=false 时生效，返回是否实际更新。
    async fn mark_sent(&self, id: &str, message_id: &str, sent_at: DateTime<Utc>) -> Result<bool>;

    /// 写入错误状态，sent 保持 false
    async fn mark_failed(
        &self,
        id: &str,
        failure: &DeliveryFailure,
        failed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// 批量删除 sent=true 且 createdAt 早于 cutoff 的记录，返回删除条数
    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 班级仓储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClassRepository: Send + Sync {
    async fn get_class(&self, id: &str) -> Result<Option<ClassRecord>>;
}

/// 用户仓储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>>;

    /// 按 ID 批量查询，单次传入的 ID 数不得超过 `batch_limit()`
    async fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<UserRecord>>;

    /// 单次批量查询允许的最大 ID 数
    fn batch_limit(&self) -> usize;
}

/// 任务仓储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 查询 dueDate 位于 [start, end) 且未完成的任务
    async fn find_due_tasks(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>>;
}
