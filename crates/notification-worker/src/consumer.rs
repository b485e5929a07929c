//! 记录创建事件消费者
//!
//! 从三个记录创建 topic 消费 `DocumentEvent`，交给触发入口处理。
//! 处理结果只影响日志与指标，位点总会被存储；幂等由各触发器自行保证。
//! 内存存储模式下额外订阅班级/用户 topic，先把记录写入本地副本再触发。

use std::sync::Arc;

use classroom_shared::config::KafkaConfig;
use classroom_shared::error::ClassroomError;
use classroom_shared::events::DocumentEvent;
use classroom_shared::kafka::{ConsumerMessage, KafkaConsumer};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::store::MemoryStore;
use crate::triggers::{NotificationHandlers, TriggerStatus};

pub struct DocumentConsumer {
    consumer: KafkaConsumer,
    topics: Vec<String>,
    handlers: Arc<NotificationHandlers>,
    mirror: Option<MemoryStore>,
}

impl DocumentConsumer {
    pub fn new(
        config: &KafkaConfig,
        handlers: Arc<NotificationHandlers>,
    ) -> Result<Self, ClassroomError> {
        Ok(Self {
            consumer: KafkaConsumer::new(config)?,
            topics: config.topics().iter().map(|t| t.to_string()).collect(),
            handlers,
            mirror: None,
        })
    }

    /// 把收到的记录同步到内存存储，同时订阅班级/用户 topic
    pub fn with_mirror(mut self, config: &KafkaConfig, store: MemoryStore) -> Self {
        self.topics
            .extend(config.mirror_topics().iter().map(|t| t.to_string()));
        self.mirror = Some(store);
        self
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), ClassroomError> {
        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;

        info!(?topics, "记录创建事件消费者已启动");

        let handlers = self.handlers;
        let mirror = self.mirror;
        self.consumer
            .run(shutdown, |msg| {
                let handlers = handlers.clone();
                let mirror = mirror.clone();
                async move {
                    handle_message(&handlers, mirror.as_ref(), &msg).await;
                }
            })
            .await;

        info!("记录创建事件消费者已停止");
        Ok(())
    }
}

/// 处理单条 Kafka 消息
///
/// 拆分为独立函数，测试中可直接调用而无需构造 Kafka 消费者。
pub async fn handle_message(
    handlers: &NotificationHandlers,
    mirror: Option<&MemoryStore>,
    msg: &ConsumerMessage,
) -> TriggerStatus {
    let event: DocumentEvent = match msg.deserialize_payload() {
        Ok(event) => event,
        Err(e) => {
            error!(
                error = %e,
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "记录创建事件反序列化失败"
            );
            return TriggerStatus::Failed;
        }
    };

    if let Some(store) = mirror {
        match store.apply_document(&event) {
            Ok(written) => debug!(
                collection = %event.collection,
                document_id = %event.document_id,
                written,
                "记录已同步到内存存储"
            ),
            Err(e) => {
                error!(document_id = %event.document_id, error = %e, "记录同步失败");
                return TriggerStatus::Failed;
            }
        }
    }

    handlers.handle_document(&event).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockPushGateway;
    use crate::store::{MemoryStore, Repositories};
    use classroom_shared::config::{DeliveryConfig, PushConfig};

    fn handlers(gateway: MockPushGateway) -> NotificationHandlers {
        handlers_over(&MemoryStore::default(), gateway)
    }

    fn handlers_over(store: &MemoryStore, gateway: MockPushGateway) -> NotificationHandlers {
        NotificationHandlers::new(
            &Repositories::from_store(Arc::new(store.clone())),
            Arc::new(gateway),
            &PushConfig::default(),
            &DeliveryConfig::default(),
        )
    }

    fn message(payload: &[u8]) -> ConsumerMessage {
        message_on("classroom.events.created", payload)
    }

    fn message_on(topic: &str, payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: 42,
            key: Some("e-1".to_string()),
            payload: payload.to_vec(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let status = handle_message(&handlers(MockPushGateway::new()), None, &message(b"not json")).await;
        assert_eq!(status, TriggerStatus::Failed);
    }

    #[tokio::test]
    async fn test_event_for_missing_class_completes() {
        let mut gateway = MockPushGateway::new();
        gateway.expect_send_multicast().never();

        let event = DocumentEvent::new(
            "events",
            "e-1",
            serde_json::json!({"classId": "c-404", "title": "Reunión de padres"}),
        );
        let payload = serde_json::to_vec(&event).unwrap();

        let status = handle_message(&handlers(gateway), None, &message(&payload)).await;
        assert_eq!(status, TriggerStatus::Completed);
    }

    #[tokio::test]
    async fn test_mirror_feeds_memory_store() {
        let store = MemoryStore::default();
        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send_multicast()
            .withf(|_, tokens| tokens.len() == 1 && tokens[0] == "tok-s1")
            .times(1)
            .returning(|_, tokens| Ok(tokens.iter().map(|_| Ok("m".to_string())).collect()));
        gateway
            .expect_send()
            .withf(|_, token| token == "tok-direct")
            .times(1)
            .returning(|_, _| Ok("m-direct".to_string()));
        let handlers = handlers_over(&store, gateway);

        let documents = [
            (
                "classroom.classes.changed",
                DocumentEvent::new(
                    "classes",
                    "c1",
                    serde_json::json!({"name": "Arte", "studentIds": ["s1"], "adminIds": []}),
                ),
            ),
            (
                "classroom.users.changed",
                DocumentEvent::new("users", "s1", serde_json::json!({"fcmToken": "tok-s1"})),
            ),
            (
                "classroom.events.created",
                DocumentEvent::new("events", "e1", serde_json::json!({"classId": "c1", "title": "Museo"})),
            ),
            (
                "classroom.notifications_queue.created",
                DocumentEvent::new(
                    "notifications_queue",
                    "q1",
                    serde_json::json!({"title": "Aviso", "body": "Hoy", "fcmToken": "tok-direct"}),
                ),
            ),
        ];

        let mut statuses = Vec::new();
        for (topic, event) in &documents {
            let payload = serde_json::to_vec(event).unwrap();
            statuses.push(handle_message(&handlers, Some(&store), &message_on(topic, &payload)).await);
        }

        assert_eq!(
            statuses,
            vec![
                TriggerStatus::Ignored,
                TriggerStatus::Ignored,
                TriggerStatus::Completed,
                TriggerStatus::Completed,
            ]
        );
        assert!(store.queue_entry("q1").unwrap().sent);
    }
}
