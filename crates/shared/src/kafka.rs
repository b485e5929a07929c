//! Kafka 消费端封装
//!
//! 文档存储的"记录已创建"事件通过 Kafka 投递到通知服务。
//! 这里把 rdkafka 的 `StreamConsumer` 封装为带优雅关闭的消费循环，
//! 并在 handler 执行完毕后才提交位点，保证至少一次投递。

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::ClassroomError;

/// 消费到的 Kafka 消息
///
/// `BorrowedMessage` 带生命周期约束，转换为拥有所有权的结构体后才能跨 await 传递。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg
                .key()
                .and_then(|k| std::str::from_utf8(k).ok())
                .map(String::from),
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            timestamp: msg.timestamp().to_millis(),
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, ClassroomError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ClassroomError::Kafka(format!("负载反序列化失败: {e}")))
    }
}

/// 面向业务的 Kafka 消费者
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// 标记消息已处理，下一次自动提交时生效
    fn store_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), ClassroomError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| ClassroomError::Kafka(e.to_string()))?;
        self.consumer
            .store_offsets(&tpl)
            .map_err(|e| ClassroomError::Kafka(e.to_string()))
    }

    /// 创建消费者
    ///
    /// 关闭自动存储位点：只有 handler 返回后才标记该消息已消费，
    /// 进程在处理中途退出时消息会被重新投递。
    pub fn new(config: &KafkaConfig) -> Result<Self, ClassroomError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| ClassroomError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), ClassroomError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| ClassroomError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 启动消费循环，直到 shutdown 变为 true
    ///
    /// handler 自行处理并记录业务错误；无论成功与否，处理结束后都会存储位点，
    /// 单条坏消息不会阻塞整个分区。
    pub async fn run<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                next = stream.next() => {
                    let Some(result) = next else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let msg = match result {
                        Ok(borrowed) => ConsumerMessage::from_borrowed(&borrowed),
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    debug!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        "收到 Kafka 消息"
                    );

                    let (topic, partition, offset) = (msg.topic.clone(), msg.partition, msg.offset);
                    handler(msg).await;

                    if let Err(e) = self.store_offset(&topic, partition, offset) {
                        error!(error = %e, topic = %topic, offset, "存储 Kafka 位点失败，消息可能被重复投递");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_payload(payload: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            topic: "classroom.tasks.created".to_string(),
            partition: 0,
            offset: 7,
            key: Some("task-1".to_string()),
            payload: payload.to_vec(),
            timestamp: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn test_consumer_message_deserialize() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Envelope {
            collection: String,
        }

        let msg = message_with_payload(br#"{"collection":"tasks"}"#);
        let envelope: Envelope = msg.deserialize_payload().unwrap();
        assert_eq!(
            envelope,
            Envelope {
                collection: "tasks".to_string()
            }
        );
    }

    #[test]
    fn test_consumer_message_deserialize_invalid_json() {
        let msg = message_with_payload(b"not json");
        let result: Result<serde_json::Value, _> = msg.deserialize_payload();
        assert!(matches!(result, Err(ClassroomError::Kafka(_))));
    }
}
