//! 内存存储
//!
//! 基于 DashMap 的存储实现，用于测试和 `memory` 存储模式。
//! 批量查询超过上限时只返回前 `batch_limit` 个 ID 的结果，与常见文档存储的截断行为一致。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classroom_shared::events::{DocumentEvent, collections};
use dashmap::DashMap;
use serde::de::DeserializeOwned;

use super::traits::{
    ClassRepository, DeliveryFailure, QueueRepository, TaskRepository, UserRepository,
};
use crate::error::{NotifyError, Result};
use crate::models::{ClassRecord, QueueEntry, TaskRecord, UserRecord};

#[derive(Debug, Clone)]
pub struct MemoryStore {
    queue: Arc<DashMap<String, QueueEntry>>,
    classes: Arc<DashMap<String, ClassRecord>>,
    users: Arc<DashMap<String, UserRecord>>,
    tasks: Arc<DashMap<String, TaskRecord>>,
    batch_limit: usize,
    user_batch_queries: Arc<AtomicUsize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(30)
    }
}

impl MemoryStore {
    pub fn new(batch_limit: usize) -> Self {
        Self {
            queue: Arc::new(DashMap::new()),
            classes: Arc::new(DashMap::new()),
            users: Arc::new(DashMap::new()),
            tasks: Arc::new(DashMap::new()),
            batch_limit: batch_limit.max(1),
            user_batch_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn insert_queue_entry(&self, entry: QueueEntry) {
        self.queue.insert(entry.id.clone(), entry);
    }

    pub fn insert_class(&self, class: ClassRecord) {
        self.classes.insert(class.id.clone(), class);
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn insert_task(&self, task: TaskRecord) {
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn queue_entry(&self, id: &str) -> Option<QueueEntry> {
        self.queue.get(id).map(|e| e.clone())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// 累计执行的批量用户查询次数
    pub fn user_batch_queries(&self) -> usize {
        self.user_batch_queries.load(Ordering::Relaxed)
    }

    /// 把记录事件写入本地副本，返回是否写入
    ///
    /// 已存在的队列记录不会被覆盖，重复投递的创建事件不能重置投递状态。
    /// 活动记录只用于触发扇出，不保存。
    pub fn apply_document(&self, event: &DocumentEvent) -> Result<bool> {
        match event.collection.as_str() {
            collections::NOTIFICATIONS_QUEUE => {
                let entry: QueueEntry = decode(event)?;
                if self.queue.contains_key(&entry.id) {
                    return Ok(false);
                }
                self.insert_queue_entry(entry);
            }
            collections::TASKS => self.insert_task(decode(event)?),
            collections::CLASSES => self.insert_class(decode(event)?),
            collections::USERS => self.insert_user(decode(event)?),
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn decode<T: DeserializeOwned>(event: &DocumentEvent) -> Result<T> {
    event
        .decode_record()
        .map_err(|e| NotifyError::Deserialization(format!("{}: {e}", event.document_id)))
}

#[async_trait]
impl QueueRepository for MemoryStore {
    async fn get_queue_entry(&self, id: &str) -> Result<Option<QueueEntry>> {
        Ok(self.queue_entry(id))
    }

    async fn mark_sent(&self, id: &str, message_id: &str, sent_at: DateTime<Utc>) -> Result<bool> {
        let Some(mut entry) = self.queue.get_mut(id) else {
            return Ok(false);
        };
        if entry.sent {
            return Ok(false);
        }

        entry.sent = true;
        entry.sent_at = Some(sent_at);
        entry.message_id = Some(message_id.to_string());
        entry.error = None;
        entry.error_code = None;
        entry.error_details = None;
        entry.error_at = None;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: &str,
        failure: &DeliveryFailure,
        failed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut entry) = self.queue.get_mut(id) else {
            return Ok(false);
        };
        if entry.sent {
            return Ok(false);
        }

        entry.error = Some(failure.message.clone());
        entry.error_code = Some(failure.code.clone());
        entry.error_details = failure.details.clone();
        entry.error_at = Some(failed_at);
        Ok(true)
    }

    async fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let before = self.queue.len();
        self.queue
            .retain(|_, entry| !(entry.sent && entry.created_at < cutoff));
        Ok((before - self.queue.len()) as u64)
    }
}

#[async_trait]
impl ClassRepository for MemoryStore {
    async fn get_class(&self, id: &str) -> Result<Option<ClassRecord>> {
        Ok(self.classes.get(id).map(|c| c.clone()))
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }

    async fn get_users_by_ids(&self, ids: &[String]) -> Result<Vec<UserRecord>> {
        self.user_batch_queries.fetch_add(1, Ordering::Relaxed);
        Ok(ids
            .iter()
            .take(self.batch_limit)
            .filter_map(|id| self.users.get(id).map(|u| u.clone()))
            .collect())
    }

    fn batch_limit(&self) -> usize {
        self.batch_limit
    }
}

#[async_trait]
impl TaskRepository for MemoryStore {
    async fn find_due_tasks(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|t| !t.is_completed)
            .filter(|t| t.due_date.is_some_and(|due| due >= start && due < end))
            .map(|t| t.clone())
            .collect();
        tasks.sort_by_key(|t| t.due_date);
        Ok(tasks)
    }
}
