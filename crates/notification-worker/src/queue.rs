//! 队列通知处理
//!
//! 每条队列记录对应一个目标 token。处理前从存储重新读取记录：
//! 已发送的记录直接短路，保证重复投递的创建事件不会导致重复推送。

use std::sync::Arc;

use chrono::Utc;
use classroom_shared::observability::metrics;
use tracing::{info, instrument, warn};

use crate::dispatch::DispatchEngine;
use crate::error::{NotifyError, Result};
use crate::gateway::DeliveryErrorKind;
use crate::models::QueueEntry;
use crate::payload::{PayloadBuilder, PayloadSource};
use crate::store::{DeliveryFailure, QueueRepository};

/// 单次处理的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Sent { message_id: String },
    Failed { code: String },
    AlreadySent,
    NotFound,
}

impl QueueOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "sent",
            Self::Failed { .. } => "failed",
            Self::AlreadySent => "already_sent",
            Self::NotFound => "not_found",
        }
    }
}

pub struct QueueDispatcher {
    queue: Arc<dyn QueueRepository>,
    builder: PayloadBuilder,
    engine: Arc<DispatchEngine>,
}

impl QueueDispatcher {
    pub fn new(
        queue: Arc<dyn QueueRepository>,
        builder: PayloadBuilder,
        engine: Arc<DispatchEngine>,
    ) -> Self {
        Self {
            queue,
            builder,
            engine,
        }
    }

    /// 处理一条新建的队列记录
    ///
    /// 投递失败写入记录的错误字段后返回 `Failed`；只有存储读写失败才返回 Err。
    #[instrument(skip(self, entry), fields(entry_id = %entry.id))]
    pub async fn handle(&self, entry: &QueueEntry) -> Result<QueueOutcome> {
        let outcome = self.process(entry).await?;
        metrics::record_queue_entry(outcome.as_str());
        Ok(outcome)
    }

    async fn process(&self, snapshot: &QueueEntry) -> Result<QueueOutcome> {
        if snapshot.sent {
            info!("队列记录已发送，跳过");
            return Ok(QueueOutcome::AlreadySent);
        }

        let Some(entry) = self.queue.get_queue_entry(&snapshot.id).await? else {
            warn!("队列记录不存在，跳过");
            return Ok(QueueOutcome::NotFound);
        };
        if entry.sent {
            info!("队列记录已被其他调用发送，跳过");
            return Ok(QueueOutcome::AlreadySent);
        }

        let prepared = entry
            .target_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NotifyError::invalid("缺少必填字段 fcmToken"))
            .and_then(|token| {
                self.builder
                    .build(PayloadSource::QueueDirect { entry: &entry }, Utc::now())
                    .map(|message| (message, token))
            });

        let (message, token) = match prepared {
            Ok(prepared) => prepared,
            Err(NotifyError::InvalidRecord(reason)) => {
                return self.reject(&entry.id, reason).await;
            }
            Err(e) => return Err(e),
        };

        let outcome = self
            .engine
            .deliver_queue_entry(self.queue.as_ref(), &entry.id, &message, token)
            .await?;

        match (outcome.message_id, outcome.error) {
            (Some(message_id), _) => Ok(QueueOutcome::Sent { message_id }),
            (None, error) => {
                let kind = error
                    .as_ref()
                    .map(|e| e.kind())
                    .unwrap_or(DeliveryErrorKind::Unknown);
                warn!(token = %outcome.token, error_kind = %kind, "队列通知发送失败");
                Ok(QueueOutcome::Failed {
                    code: kind.as_str().to_string(),
                })
            }
        }
    }

    async fn reject(&self, entry_id: &str, reason: String) -> Result<QueueOutcome> {
        warn!(entry_id, reason = %reason, "队列记录无效，写入错误状态");

        let failure = DeliveryFailure {
            message: reason,
            code: DeliveryErrorKind::InvalidRecord.as_str().to_string(),
            details: None,
        };
        self.queue.mark_failed(entry_id, &failure, Utc::now()).await?;

        Ok(QueueOutcome::Failed { code: failure.code })
    }
}
