//! 文档事件定义
//!
//! 文档存储在记录创建后通过 Kafka 投递的事件信封。
//! 投递语义为至少一次：同一条 `event_id` 可能被重复投递，消费方必须幂等。

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 集合名常量，与文档存储中的集合/表名一致
pub mod collections {
    pub const NOTIFICATIONS_QUEUE: &str = "notifications_queue";
    pub const TASKS: &str = "tasks";
    pub const EVENTS: &str = "events";
    pub const CLASSES: &str = "classes";
    pub const USERS: &str = "users";
}

/// 记录创建事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentEvent {
    pub event_id: String,
    /// 记录所在集合，决定由哪个触发器处理
    pub collection: String,
    /// 记录 ID，以信封为准（记录正文中可能不含 id 字段）
    pub document_id: String,
    /// 记录正文快照（创建时刻）
    pub data: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DocumentEvent {
    pub fn new(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7().to_string(),
            collection: collection.into(),
            document_id: document_id.into(),
            data,
            occurred_at: Utc::now(),
        }
    }

    /// 将正文反序列化为目标记录类型，并以信封中的 document_id 作为记录 ID
    ///
    /// 正文中的 `id` 字段会被覆盖。
    pub fn decode_record<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let mut data = self.data.clone();
        if let serde_json::Value::Object(map) = &mut data {
            map.insert(
                "id".to_string(),
                serde_json::Value::String(self.document_id.clone()),
            );
        }
        serde_json::from_value(data)
    }
}
