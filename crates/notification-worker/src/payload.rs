//! 消息构建
//!
//! 把任务/活动/队列记录转换为与平台无关的 `Message`。纯函数，不做 I/O。
//!
//! 数据合并规则：构建器派生的键（type、taskId、eventId、classId、click_action、timestamp）
//! 始终覆盖上游 data 中的同名键；其余上游键原样透传。
//! 推送服务只接受字符串值：数字和布尔值转为字符串，嵌套结构和 null 视为无效记录。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use classroom_shared::config::PushConfig;
use serde::Serialize;

use crate::error::{NotifyError, Result};
use crate::models::{ClassRecord, EventRecord, QueueEntry, TaskRecord};

const DEFAULT_TEST_TITLE: &str = "🧪 Test notification";
const DEFAULT_TEST_BODY: &str = "This is a test notification";
/// Android 消息折叠/过期窗口
const DIRECT_TTL_SECS: u64 = 86_400;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskCreated,
    EventCreated,
    TaskReminder,
    QueueDirect,
    Test,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::EventCreated => "event_created",
            Self::TaskReminder => "task_reminder",
            Self::QueueDirect => "queue_direct",
            Self::Test => "test",
        }
    }

    /// 单人直发的消息需要展示型推送（alert + 可变内容 + 折叠窗口）
    fn is_direct(&self) -> bool {
        matches!(self, Self::QueueDirect | Self::Test)
    }
}

/// Android 投递参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndroidHints {
    pub high_priority: bool,
    pub channel_id: String,
    pub sound: String,
    pub public_visibility: bool,
    pub default_sound: bool,
    pub default_vibrate_timings: bool,
    pub collapse_key: Option<String>,
    pub ttl_secs: Option<u64>,
}

/// APNs 投递参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApnsHints {
    /// apns-priority 头，10 为立即投递
    pub priority: u8,
    /// apns-push-type 头
    pub push_type: Option<String>,
    /// 展示型推送需要在 aps.alert 中携带标题与正文
    pub alert: bool,
    pub sound: String,
    pub badge: Option<u32>,
    /// 后台唤醒（content-available）
    pub content_available: bool,
    pub mutable_content: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformHints {
    pub android: AndroidHints,
    pub apns: ApnsHints,
}

/// 待发送的消息，每次投递构建一次，发送后即丢弃
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub title: String,
    pub body: String,
    pub data: BTreeMap<String, String>,
    pub hints: PlatformHints,
}

/// 消息来源记录
#[derive(Debug, Clone, Copy)]
pub enum PayloadSource<'a> {
    TaskCreated {
        task: &'a TaskRecord,
        class: &'a ClassRecord,
    },
    EventCreated {
        event: &'a EventRecord,
        class: &'a ClassRecord,
    },
    TaskReminder {
        task: &'a TaskRecord,
    },
    QueueDirect {
        entry: &'a QueueEntry,
    },
    Test {
        title: Option<&'a str>,
        body: Option<&'a str>,
    },
}

/// 消息构建器
///
/// 渠道 ID、折叠键和点击动作来自推送配置，其余平台参数按消息类型固定。
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    channel_id: String,
    collapse_key: String,
    click_action: String,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::from_config(&PushConfig::default())
    }
}

impl PayloadBuilder {
    pub fn from_config(config: &PushConfig) -> Self {
        Self {
            channel_id: config.android_channel_id.clone(),
            collapse_key: config.collapse_key.clone(),
            click_action: config.click_action.clone(),
        }
    }

    /// 构建消息
    ///
    /// `issued_at` 写入直发消息的 timestamp 键，由调用方传入以保持纯函数。
    pub fn build(&self, source: PayloadSource<'_>, issued_at: DateTime<Utc>) -> Result<Message> {
        let (kind, title, body, mut data) = match source {
            PayloadSource::TaskCreated { task, class } => {
                let title = required("task.title", &task.title)?;
                let class_id = required("task.classId", &task.class_id)?;
                (
                    MessageKind::TaskCreated,
                    format!("New task: {title}"),
                    format!("A new task was assigned in {}", class.name),
                    derived([("type", "task"), ("taskId", &task.id), ("classId", class_id)]),
                )
            }
            PayloadSource::EventCreated { event, class } => {
                let title = required("event.title", &event.title)?;
                let class_id = required("event.classId", &event.class_id)?;
                (
                    MessageKind::EventCreated,
                    format!("New event: {title}"),
                    format!("A new event was scheduled in {}", class.name),
                    derived([("type", "event"), ("eventId", &event.id), ("classId", class_id)]),
                )
            }
            PayloadSource::TaskReminder { task } => {
                let title = required("task.title", &task.title)?;
                let class_id = required("task.classId", &task.class_id)?;
                (
                    MessageKind::TaskReminder,
                    "⏰ Task reminder".to_string(),
                    format!("Task \"{title}\" is due tomorrow"),
                    derived([
                        ("type", "task_reminder"),
                        ("taskId", &task.id),
                        ("classId", class_id),
                    ]),
                )
            }
            PayloadSource::QueueDirect { entry } => {
                required("queue.title", &entry.title)?;
                required("queue.body", &entry.body)?;
                (
                    MessageKind::QueueDirect,
                    entry.title.clone(),
                    entry.body.clone(),
                    coerce_data(&entry.data)?,
                )
            }
            PayloadSource::Test { title, body } => (
                MessageKind::Test,
                non_blank(title).unwrap_or(DEFAULT_TEST_TITLE).to_string(),
                non_blank(body).unwrap_or(DEFAULT_TEST_BODY).to_string(),
                derived([("type", "test")]),
            ),
        };

        data.insert("click_action".to_string(), self.click_action.clone());
        if kind.is_direct() {
            data.insert(
                "timestamp".to_string(),
                issued_at.timestamp_millis().to_string(),
            );
        }

        Ok(Message {
            kind,
            title,
            body,
            data,
            hints: self.hints_for(kind),
        })
    }

    fn hints_for(&self, kind: MessageKind) -> PlatformHints {
        let direct = kind.is_direct();
        PlatformHints {
            android: AndroidHints {
                high_priority: true,
                channel_id: self.channel_id.clone(),
                sound: "default".to_string(),
                public_visibility: true,
                default_sound: direct,
                default_vibrate_timings: direct,
                collapse_key: direct.then(|| self.collapse_key.clone()),
                ttl_secs: direct.then_some(DIRECT_TTL_SECS),
            },
            apns: ApnsHints {
                priority: 10,
                push_type: direct.then(|| "alert".to_string()),
                alert: direct,
                sound: "default".to_string(),
                badge: Some(1),
                content_available: true,
                mutable_content: direct,
            },
        }
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(NotifyError::invalid(format!("缺少必填字段 {field}")));
    }
    Ok(trimmed)
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn derived<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// 把上游 data 转为字符串映射
fn coerce_data(data: &BTreeMap<String, serde_json::Value>) -> Result<BTreeMap<String, String>> {
    data.iter()
        .map(|(key, value)| coerce_value(key, value).map(|v| (key.clone(), v)))
        .collect()
}

fn coerce_value(key: &str, value: &serde_json::Value) -> Result<String> {
    use serde_json::Value;

    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(NotifyError::invalid(format!("data.{key} 为 null"))),
        Value::Array(_) | Value::Object(_) => Err(NotifyError::invalid(format!(
            "data.{key} 不支持嵌套结构"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn issued_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap()
    }

    fn class() -> ClassRecord {
        ClassRecord {
            id: "class-1".to_string(),
            name: "Historia 2A".to_string(),
            student_ids: vec!["s1".to_string()],
            admin_ids: vec!["t1".to_string()],
        }
    }

    fn task() -> TaskRecord {
        TaskRecord {
            id: "task-1".to_string(),
            class_id: "class-1".to_string(),
            title: "Ensayo".to_string(),
            due_date: None,
            is_completed: false,
        }
    }

    #[test]
    fn test_task_created_template() {
        let builder = PayloadBuilder::default();
        let class = class();
        let task = task();
        let message = builder
            .build(
                PayloadSource::TaskCreated {
                    task: &task,
                    class: &class,
                },
                issued_at(),
            )
            .unwrap();

        assert_eq!(message.kind, MessageKind::TaskCreated);
        assert_eq!(message.title, "New task: Ensayo");
        assert_eq!(message.body, "A new task was assigned in Historia 2A");
        assert_eq!(message.data["type"], "task");
        assert_eq!(message.data["taskId"], "task-1");
        assert_eq!(message.data["classId"], "class-1");
        assert_eq!(message.data["click_action"], "FLUTTER_NOTIFICATION_CLICK");
        assert!(!message.data.contains_key("timestamp"));
    }

    #[test]
    fn test_event_created_template() {
        let builder = PayloadBuilder::default();
        let class = class();
        let event = EventRecord {
            id: "event-7".to_string(),
            class_id: "class-1".to_string(),
            title: "Feria de ciencias".to_string(),
        };
        let message = builder
            .build(
                PayloadSource::EventCreated {
                    event: &event,
                    class: &class,
                },
                issued_at(),
            )
            .unwrap();

        assert_eq!(message.title, "New event: Feria de ciencias");
        assert_eq!(message.body, "A new event was scheduled in Historia 2A");
        assert_eq!(message.data["type"], "event");
        assert_eq!(message.data["eventId"], "event-7");
    }

    #[test]
    fn test_task_reminder_template() {
        let builder = PayloadBuilder::default();
        let task = task();
        let message = builder
            .build(PayloadSource::TaskReminder { task: &task }, issued_at())
            .unwrap();

        assert_eq!(message.title, "⏰ Task reminder");
        assert_eq!(message.body, "Task \"Ensayo\" is due tomorrow");
        assert_eq!(message.data["type"], "task_reminder");
        assert_eq!(message.data["classId"], "class-1");
    }

    #[test]
    fn test_queue_direct_copies_and_coerces() {
        let builder = PayloadBuilder::default();
        let entry = QueueEntry::new("q-1", "T", "B", "tok1")
            .with_data("k", serde_json::json!("v"))
            .with_data("attempt", serde_json::json!(3))
            .with_data("urgent", serde_json::json!(true));

        let message = builder
            .build(PayloadSource::QueueDirect { entry: &entry }, issued_at())
            .unwrap();

        assert_eq!(message.title, "T");
        assert_eq!(message.body, "B");
        assert_eq!(message.data["k"], "v");
        assert_eq!(message.data["attempt"], "3");
        assert_eq!(message.data["urgent"], "true");
        assert_eq!(
            message.data["timestamp"],
            issued_at().timestamp_millis().to_string()
        );
    }

    #[test]
    fn test_queue_direct_keeps_whitespace() {
        let entry = QueueEntry::new("q", "  Aviso  ", "Línea 1\n", "tok");

        let message = PayloadBuilder::default()
            .build(PayloadSource::QueueDirect { entry: &entry }, issued_at())
            .unwrap();

        assert_eq!(message.title, "  Aviso  ");
        assert_eq!(message.body, "Línea 1\n");
    }

    #[test]
    fn test_derived_keys_win_over_upstream_data() {
        let builder = PayloadBuilder::default();
        let entry = QueueEntry::new("q-1", "T", "B", "tok1")
            .with_data("click_action", serde_json::json!("OPEN_WEB"))
            .with_data("type", serde_json::json!("chat"));

        let message = builder
            .build(PayloadSource::QueueDirect { entry: &entry }, issued_at())
            .unwrap();

        assert_eq!(message.data["click_action"], "FLUTTER_NOTIFICATION_CLICK");
        // 构建器不派生 type 的类型，上游值透传
        assert_eq!(message.data["type"], "chat");
    }

    #[test]
    fn test_nested_data_is_invalid() {
        let builder = PayloadBuilder::default();
        let entry = QueueEntry::new("q-1", "T", "B", "tok1")
            .with_data("grades", serde_json::json!({"math": 9}));

        let err = builder
            .build(PayloadSource::QueueDirect { entry: &entry }, issued_at())
            .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidRecord(_)));

        let entry = QueueEntry::new("q-2", "T", "B", "tok1").with_data("x", serde_json::Value::Null);
        assert!(
            builder
                .build(PayloadSource::QueueDirect { entry: &entry }, issued_at())
                .is_err()
        );
    }

    #[test]
    fn test_missing_title_is_invalid() {
        let builder = PayloadBuilder::default();
        let mut task = task();
        task.title = "  ".to_string();

        let err = builder
            .build(PayloadSource::TaskReminder { task: &task }, issued_at())
            .unwrap_err();
        assert_eq!(err.code(), "invalid-record");
    }

    #[test]
    fn test_platform_hint_profiles() {
        let builder = PayloadBuilder::default();
        let entry = QueueEntry::new("q-1", "T", "B", "tok1");
        let direct = builder
            .build(PayloadSource::QueueDirect { entry: &entry }, issued_at())
            .unwrap();

        assert!(direct.hints.android.high_priority);
        assert_eq!(direct.hints.android.channel_id, "high_importance_channel");
        assert_eq!(direct.hints.android.ttl_secs, Some(86_400));
        assert_eq!(direct.hints.android.collapse_key.as_deref(), Some("controlaschool"));
        assert_eq!(direct.hints.apns.priority, 10);
        assert_eq!(direct.hints.apns.push_type.as_deref(), Some("alert"));
        assert!(direct.hints.apns.content_available);
        assert!(direct.hints.apns.mutable_content);

        let task = task();
        let broadcast = builder
            .build(PayloadSource::TaskReminder { task: &task }, issued_at())
            .unwrap();
        assert!(broadcast.hints.android.collapse_key.is_none());
        assert!(broadcast.hints.android.ttl_secs.is_none());
        assert!(broadcast.hints.apns.content_available);
        assert!(!broadcast.hints.apns.alert);
    }

    #[test]
    fn test_test_message_defaults() {
        let builder = PayloadBuilder::default();
        let message = builder
            .build(
                PayloadSource::Test {
                    title: None,
                    body: Some(""),
                },
                issued_at(),
            )
            .unwrap();

        assert_eq!(message.title, DEFAULT_TEST_TITLE);
        assert_eq!(message.body, DEFAULT_TEST_BODY);
        assert_eq!(message.data["type"], "test");
    }
}
