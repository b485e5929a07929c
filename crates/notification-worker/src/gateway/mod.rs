//! 推送网关
//!
//! 通过 `PushGateway` trait 抽象推送服务：单 token 发送返回 message id，
//! 多播返回与输入 token 一一对应的结果。生产环境使用 FCM HTTP v1，
//! 开发环境可切换为只记日志的模拟网关。

mod auth;
mod fcm;
mod simulated;

pub use auth::{AccessTokenSource, ServiceAccountKey, ServiceAccountTokenSource, StaticTokenSource};
pub use fcm::FcmGateway;
pub use simulated::LogGateway;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::Message;

/// 单个 token 的投递失败分类
///
/// 区分的意义：unregistered/malformed 的 token 应从用户记录中清理，
/// transient 类错误可以在下一次自然触发时重试。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryErrorKind {
    UnregisteredToken,
    MalformedToken,
    QuotaExceeded,
    Transient,
    Authentication,
    TransportFailure,
    InvalidRecord,
    Unknown,
}

impl DeliveryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnregisteredToken => "unregistered-token",
            Self::MalformedToken => "malformed-token",
            Self::QuotaExceeded => "quota-exceeded",
            Self::Transient => "transient",
            Self::Authentication => "authentication",
            Self::TransportFailure => "transport-failure",
            Self::InvalidRecord => "invalid-record",
            Self::Unknown => "unknown",
        }
    }

    /// token 本身已失效，重试没有意义
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::UnregisteredToken | Self::MalformedToken)
    }

    /// 按 gRPC `status` 分类，只在响应没有 `details[].errorCode` 时使用
    ///
    /// 载荷错误同样返回 INVALID_ARGUMENT，仅凭 status 不能断定 token 无效。
    pub fn from_fcm_status(status: &str) -> Self {
        match status {
            "INVALID_ARGUMENT" => Self::Unknown,
            other => Self::from_fcm_code(other),
        }
    }

    /// 按 FCM v1 错误码（`details[].errorCode`）分类
    pub fn from_fcm_code(code: &str) -> Self {
        match code {
            "UNREGISTERED" | "NOT_FOUND" | "SENDER_ID_MISMATCH" => Self::UnregisteredToken,
            "INVALID_ARGUMENT" => Self::MalformedToken,
            "QUOTA_EXCEEDED" | "RESOURCE_EXHAUSTED" => Self::QuotaExceeded,
            "UNAVAILABLE" | "INTERNAL" | "DEADLINE_EXCEEDED" => Self::Transient,
            "THIRD_PARTY_AUTH_ERROR" | "UNAUTHENTICATED" | "PERMISSION_DENIED" => {
                Self::Authentication
            }
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 网关错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// 网关收到请求但拒绝投递到该 token
    #[error("推送被拒绝: {kind} ({code}): {message}")]
    Rejected {
        kind: DeliveryErrorKind,
        code: String,
        message: String,
    },

    /// 请求没有到达网关或网关整体不可用
    #[error("推送网关传输失败: {0}")]
    Transport(String),
}

impl GatewayError {
    pub fn rejected(
        kind: DeliveryErrorKind,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Rejected {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> DeliveryErrorKind {
        match self {
            Self::Rejected { kind, .. } => *kind,
            Self::Transport(_) => DeliveryErrorKind::TransportFailure,
        }
    }

    /// 网关返回的原始错误码，传输失败时为 None
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => Some(code),
            Self::Transport(_) => None,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// 多播中单个 token 的结果，成功时为 message id
pub type TokenResult = Result<String, GatewayError>;

/// 推送网关 trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// 网关名称（用于日志）
    fn name(&self) -> &str;

    /// 发送到单个 token，成功返回网关分配的 message id
    async fn send(&self, message: &Message, token: &str) -> Result<String, GatewayError>;

    /// 多播发送
    ///
    /// 返回值与 `tokens` 等长且顺序一致；单个 token 失败体现在对应元素上。
    /// 只有整个调用被拒绝时才返回 Err。
    async fn send_multicast(
        &self,
        message: &Message,
        tokens: &[String],
    ) -> Result<Vec<TokenResult>, GatewayError>;
}
