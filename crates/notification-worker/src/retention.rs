//! 已发送队列记录的保留期清理
//!
//! 只删除 sent=true 的记录；带错误字段的失败记录保留给运维排查。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use classroom_shared::observability::metrics;
use tracing::{info, instrument};

use crate::error::Result;
use crate::store::QueueRepository;

pub struct RetentionSweeper {
    queue: Arc<dyn QueueRepository>,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(queue: Arc<dyn QueueRepository>, retention_days: i64) -> Self {
        Self {
            queue,
            retention: Duration::days(retention_days),
        }
    }

    pub async fn sweep(&self) -> Result<u64> {
        self.sweep_at(Utc::now()).await
    }

    /// 删除 createdAt 早于 now - 保留期 的已发送记录，返回删除条数
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.retention;
        let deleted = self.queue.delete_sent_before(cutoff).await?;

        metrics::record_retention_deleted(deleted);
        info!(deleted, cutoff = %cutoff, "已发送队列记录清理完成");

        Ok(deleted)
    }
}
