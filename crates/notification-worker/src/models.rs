//! 领域模型
//!
//! 与文档存储中的记录一一对应，字段名沿用存储中的 camelCase 命名。
//! 本服务只修改 `QueueEntry` 的投递状态字段，其余记录均为只读。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 通知队列记录
///
/// 由上游生产者创建，本服务最多修改一次：成功时写入 sent/sentAt/messageId，
/// 失败时写入 error* 字段。两组字段不会同时存在。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// 上游携带的业务数据，值在构建消息时统一转为字符串
    #[serde(default, rename = "data", alias = "dataPayload")]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default, rename = "fcmToken", alias = "targetToken")]
    pub target_token: Option<String>,
    #[serde(default)]
    pub sent: bool,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_details: Option<String>,
    #[serde(default)]
    pub error_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        target_token: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            data: BTreeMap::new(),
            target_token: Some(target_token.into()),
            sent: false,
            sent_at: None,
            message_id: None,
            error: None,
            error_code: None,
            error_details: None,
            error_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// 当前投递状态
    pub fn status(&self) -> QueueStatus {
        if self.sent {
            QueueStatus::Sent
        } else if self.error.is_some() {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        }
    }
}

/// 队列记录状态机
///
/// `Pending -> Sent | Failed`。Sent 为终态；Failed 不会被自动重试，
/// 需要运维人工把 sent 重置或创建新记录。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Sent,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

/// 班级记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub student_ids: Vec<String>,
    #[serde(default)]
    pub admin_ids: Vec<String>,
}

impl ClassRecord {
    /// 按受众返回成员 ID，保持首次出现顺序并去重
    ///
    /// 同时是学生和管理员的用户只出现一次。
    pub fn members(&self, audience: Audience) -> Vec<String> {
        let admins: &[String] = match audience {
            Audience::Members => &self.admin_ids,
            Audience::StudentsOnly => &[],
        };

        let mut seen = std::collections::HashSet::new();
        self.student_ids
            .iter()
            .chain(admins)
            .filter(|id| !id.is_empty() && seen.insert(id.as_str()))
            .cloned()
            .collect()
    }
}

/// 推送受众
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// 学生 + 管理员（任务/活动创建通知）
    Members,
    /// 仅学生（到期提醒）
    StudentsOnly,
}

/// 用户记录，未注册设备时 fcmToken 为空
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub fcm_token: Option<String>,
}

impl UserRecord {
    /// 可投递的 token，空白字符串视为未注册
    pub fn deliverable_token(&self) -> Option<&str> {
        self.fcm_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

/// 任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub class_id: String,
    pub title: String,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_completed: bool,
}

/// 活动记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub class_id: String,
    pub title: String,
}
