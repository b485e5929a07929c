//! 班级扇出通知
//!
//! 记录 -> 班级成员 -> 设备 token -> 消息 -> 多播。
//! 单个 token 的失败只记录日志和计数；只有整个网关调用失败时才向上返回错误。

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::dispatch::{DeliveryReport, DispatchEngine};
use crate::error::Result;
use crate::models::{Audience, EventRecord, TaskRecord};
use crate::payload::{PayloadBuilder, PayloadSource};
use crate::recipients::{RecipientResolver, TokenResolver};
use crate::store::{ClassRepository, UserRepository};

/// 扇出的来源记录
#[derive(Debug, Clone, Copy)]
pub enum FanoutSource<'a> {
    TaskCreated(&'a TaskRecord),
    EventCreated(&'a EventRecord),
    TaskReminder(&'a TaskRecord),
}

impl FanoutSource<'_> {
    fn class_id(&self) -> &str {
        match self {
            Self::TaskCreated(task) | Self::TaskReminder(task) => &task.class_id,
            Self::EventCreated(event) => &event.class_id,
        }
    }

    fn record_id(&self) -> &str {
        match self {
            Self::TaskCreated(task) | Self::TaskReminder(task) => &task.id,
            Self::EventCreated(event) => &event.id,
        }
    }

    /// 创建通知发给学生和管理员，到期提醒只发给学生
    fn audience(&self) -> Audience {
        match self {
            Self::TaskCreated(_) | Self::EventCreated(_) => Audience::Members,
            Self::TaskReminder(_) => Audience::StudentsOnly,
        }
    }
}

pub struct FanoutNotifier {
    recipients: RecipientResolver,
    tokens: TokenResolver,
    builder: PayloadBuilder,
    engine: Arc<DispatchEngine>,
}

impl FanoutNotifier {
    pub fn new(
        classes: Arc<dyn ClassRepository>,
        users: Arc<dyn UserRepository>,
        builder: PayloadBuilder,
        engine: Arc<DispatchEngine>,
    ) -> Self {
        Self {
            recipients: RecipientResolver::new(classes),
            tokens: TokenResolver::new(users),
            builder,
            engine,
        }
    }

    /// 向记录所属班级扇出通知
    ///
    /// 班级不存在或没有可投递的 token 时返回 `{0, 0}`，不调用网关。
    #[instrument(skip(self, source), fields(record_id = %source.record_id(), class_id = %source.class_id()))]
    pub async fn notify(&self, source: FanoutSource<'_>) -> Result<DeliveryReport> {
        let resolved = match self
            .recipients
            .resolve(source.class_id(), source.audience())
            .await
        {
            Ok(resolved) => resolved,
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "班级不存在，跳过通知");
                return Ok(DeliveryReport::default());
            }
            Err(e) => return Err(e),
        };

        let tokens = self.tokens.resolve(&resolved.members).await?;
        if tokens.is_empty() {
            info!(members = resolved.members.len(), "没有可投递的设备 token，跳过通知");
            return Ok(DeliveryReport::default());
        }

        let payload_source = match source {
            FanoutSource::TaskCreated(task) => PayloadSource::TaskCreated {
                task,
                class: &resolved.class,
            },
            FanoutSource::EventCreated(event) => PayloadSource::EventCreated {
                event,
                class: &resolved.class,
            },
            FanoutSource::TaskReminder(task) => PayloadSource::TaskReminder { task },
        };
        let message = self.builder.build(payload_source, Utc::now())?;

        let outcomes = self.engine.send_many(&message, &tokens).await?;
        let report = DeliveryReport::from_outcomes(&outcomes);

        info!(
            kind = message.kind.as_str(),
            tokens = tokens.len(),
            success_count = report.success_count,
            failure_count = report.failure_count,
            "班级通知已发送"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockPushGateway;
    use crate::models::{ClassRecord, UserRecord};
    use crate::store::MemoryStore;

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::default();
        store.insert_class(ClassRecord {
            id: "c1".to_string(),
            name: "Química".to_string(),
            student_ids: vec!["s1".to_string(), "s2".to_string()],
            admin_ids: vec!["t1".to_string()],
        });
        for id in ["s1", "s2", "t1"] {
            store.insert_user(UserRecord {
                id: id.to_string(),
                fcm_token: Some(format!("tok-{id}")),
            });
        }
        store
    }

    fn notifier(store: &MemoryStore, gateway: MockPushGateway) -> FanoutNotifier {
        FanoutNotifier::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            PayloadBuilder::default(),
            Arc::new(DispatchEngine::new(Arc::new(gateway))),
        )
    }

    fn task() -> TaskRecord {
        TaskRecord {
            id: "t-1".to_string(),
            class_id: "c1".to_string(),
            title: "Laboratorio".to_string(),
            due_date: None,
            is_completed: false,
        }
    }

    #[tokio::test]
    async fn test_task_created_includes_admins() {
        let store = seeded_store();
        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send_multicast()
            .withf(|message, tokens| {
                message.data["type"] == "task" && tokens == ["tok-s1", "tok-s2", "tok-t1"]
            })
            .times(1)
            .returning(|_, tokens| Ok(tokens.iter().map(|t| Ok(format!("m-{t}"))).collect()));

        let task = task();
        let report = notifier(&store, gateway)
            .notify(FanoutSource::TaskCreated(&task))
            .await
            .unwrap();
        assert_eq!(report.success_count, 3);
    }

    #[tokio::test]
    async fn test_reminder_is_students_only() {
        let store = seeded_store();
        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send_multicast()
            .withf(|_, tokens| tokens == ["tok-s1", "tok-s2"])
            .times(1)
            .returning(|_, tokens| Ok(tokens.iter().map(|t| Ok(format!("m-{t}"))).collect()));

        let task = task();
        let report = notifier(&store, gateway)
            .notify(FanoutSource::TaskReminder(&task))
            .await
            .unwrap();
        assert_eq!(report.success_count, 2);
    }

    #[tokio::test]
    async fn test_missing_class_is_noop() {
        let store = MemoryStore::default();
        let mut gateway = MockPushGateway::new();
        gateway.expect_send_multicast().never();

        let event = EventRecord {
            id: "e-1".to_string(),
            class_id: "deleted".to_string(),
            title: "Excursión".to_string(),
        };
        let report = notifier(&store, gateway)
            .notify(FanoutSource::EventCreated(&event))
            .await
            .unwrap();
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn test_no_tokens_skips_gateway() {
        let store = MemoryStore::default();
        store.insert_class(ClassRecord {
            id: "c1".to_string(),
            name: "Arte".to_string(),
            student_ids: vec!["s1".to_string()],
            admin_ids: vec![],
        });
        store.insert_user(UserRecord {
            id: "s1".to_string(),
            fcm_token: None,
        });

        let mut gateway = MockPushGateway::new();
        gateway.expect_send_multicast().never();

        let task = task();
        let report = notifier(&store, gateway)
            .notify(FanoutSource::TaskCreated(&task))
            .await
            .unwrap();
        assert_eq!(report.success_count + report.failure_count, 0);
    }
}
