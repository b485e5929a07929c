//! 触发入口
//!
//! 外部触发基座（Kafka 记录创建事件、定时器）只通过这里调用核心逻辑。
//! 触发可能被重复投递，所有入口都是幂等的。调用边界负责记录日志与指标，
//! 失败不会被重试：下一次自然触发（新记录、下一轮定时）即是恢复路径。

use std::fmt::Debug;
use std::sync::Arc;

use classroom_shared::config::{DeliveryConfig, PushConfig};
use classroom_shared::events::{DocumentEvent, collections};
use classroom_shared::observability::metrics;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DeliveryReport, DispatchEngine};
use crate::error::{NotifyError, Result};
use crate::fanout::{FanoutNotifier, FanoutSource};
use crate::gateway::PushGateway;
use crate::models::{EventRecord, QueueEntry, TaskRecord};
use crate::payload::PayloadBuilder;
use crate::queue::{QueueDispatcher, QueueOutcome};
use crate::reminder::{ReminderScanner, ReminderSweepReport};
use crate::retention::RetentionSweeper;
use crate::store::Repositories;

/// 触发器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    QueueEntryCreated,
    TaskCreated,
    EventCreated,
    DailyRetentionSweep,
    HourlyReminderSweep,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueEntryCreated => "on_queue_entry_created",
            Self::TaskCreated => "on_task_created",
            Self::EventCreated => "on_event_created",
            Self::DailyRetentionSweep => "on_daily_retention_sweep",
            Self::HourlyReminderSweep => "on_hourly_reminder_sweep",
        }
    }

    /// 记录创建事件按集合名映射到触发器
    pub fn from_collection(collection: &str) -> Option<Self> {
        match collection {
            collections::NOTIFICATIONS_QUEUE => Some(Self::QueueEntryCreated),
            collections::TASKS => Some(Self::TaskCreated),
            collections::EVENTS => Some(Self::EventCreated),
            _ => None,
        }
    }
}

/// 一次触发在调用边界上的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    Completed,
    Failed,
    Ignored,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
        }
    }
}

/// 通知服务的全部触发处理器
pub struct NotificationHandlers {
    queue: QueueDispatcher,
    fanout: Arc<FanoutNotifier>,
    reminder: ReminderScanner,
    retention: RetentionSweeper,
}

impl NotificationHandlers {
    pub fn new(
        repos: &Repositories,
        gateway: Arc<dyn PushGateway>,
        push: &PushConfig,
        delivery: &DeliveryConfig,
    ) -> Self {
        let builder = PayloadBuilder::from_config(push);
        let engine = Arc::new(DispatchEngine::new(gateway));

        let fanout = Arc::new(FanoutNotifier::new(
            repos.classes.clone(),
            repos.users.clone(),
            builder.clone(),
            engine.clone(),
        ));

        Self {
            queue: QueueDispatcher::new(repos.queue.clone(), builder, engine),
            reminder: ReminderScanner::new(
                repos.tasks.clone(),
                fanout.clone(),
                delivery.reminder_window_hours,
            ),
            retention: RetentionSweeper::new(repos.queue.clone(), delivery.retention_days),
            fanout,
        }
    }

    pub async fn on_queue_entry_created(&self, entry: &QueueEntry) -> Result<QueueOutcome> {
        self.queue.handle(entry).await
    }

    pub async fn on_task_created(&self, task: &TaskRecord) -> Result<DeliveryReport> {
        self.fanout.notify(FanoutSource::TaskCreated(task)).await
    }

    pub async fn on_event_created(&self, event: &EventRecord) -> Result<DeliveryReport> {
        self.fanout.notify(FanoutSource::EventCreated(event)).await
    }

    pub async fn on_daily_retention_sweep(&self) -> Result<u64> {
        self.retention.sweep().await
    }

    pub async fn on_hourly_reminder_sweep(&self) -> Result<ReminderSweepReport> {
        self.reminder.sweep().await
    }

    /// 处理一条记录创建事件
    ///
    /// 未知集合的事件被忽略；正文无法解析为记录时记为失败。
    pub async fn handle_document(&self, event: &DocumentEvent) -> TriggerStatus {
        let Some(kind) = TriggerKind::from_collection(&event.collection) else {
            debug!(
                collection = %event.collection,
                document_id = %event.document_id,
                "未注册的集合，忽略事件"
            );
            metrics::record_trigger("unknown", TriggerStatus::Ignored.as_str());
            return TriggerStatus::Ignored;
        };

        debug!(
            trigger = kind.as_str(),
            event_id = %event.event_id,
            document_id = %event.document_id,
            "收到记录创建事件"
        );

        match kind {
            TriggerKind::QueueEntryCreated => {
                let result = match decode::<QueueEntry>(event) {
                    Ok(entry) => self.on_queue_entry_created(&entry).await,
                    Err(e) => Err(e),
                };
                complete(kind, result)
            }
            TriggerKind::TaskCreated => {
                let result = match decode::<TaskRecord>(event) {
                    Ok(task) => self.on_task_created(&task).await,
                    Err(e) => Err(e),
                };
                complete(kind, result)
            }
            TriggerKind::EventCreated => {
                let result = match decode::<EventRecord>(event) {
                    Ok(record) => self.on_event_created(&record).await,
                    Err(e) => Err(e),
                };
                complete(kind, result)
            }
            TriggerKind::DailyRetentionSweep | TriggerKind::HourlyReminderSweep => {
                warn!(trigger = kind.as_str(), "定时触发器不接受记录事件");
                TriggerStatus::Ignored
            }
        }
    }

    /// 执行定时触发
    pub async fn run_timer(&self, kind: TriggerKind) -> TriggerStatus {
        match kind {
            TriggerKind::DailyRetentionSweep => complete(kind, self.on_daily_retention_sweep().await),
            TriggerKind::HourlyReminderSweep => {
                complete(kind, self.on_hourly_reminder_sweep().await)
            }
            _ => {
                warn!(trigger = kind.as_str(), "不是定时触发器");
                TriggerStatus::Ignored
            }
        }
    }
}

fn decode<T: DeserializeOwned>(event: &DocumentEvent) -> Result<T> {
    event
        .decode_record()
        .map_err(|e| NotifyError::Deserialization(format!("{}: {e}", event.document_id)))
}

/// 调用边界：记录结果，错误在这里终结
fn complete<T: Debug>(kind: TriggerKind, result: Result<T>) -> TriggerStatus {
    let status = match result {
        Ok(outcome) => {
            info!(trigger = kind.as_str(), ?outcome, "触发处理完成");
            TriggerStatus::Completed
        }
        Err(e) => {
            error!(trigger = kind.as_str(), error = %e, code = e.code(), "触发处理失败");
            TriggerStatus::Failed
        }
    };
    metrics::record_trigger(kind.as_str(), status.as_str());
    status
}
