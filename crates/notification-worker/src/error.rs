//! 通知服务错误类型
//!
//! 按处理策略划分错误：
//! - `NotFound`：引用的班级/用户/记录不存在，视为"无事可做"，永不致命
//! - `InvalidRecord`：输入记录格式错误，本次调用失败且不重试
//! - `GatewayTransport`：整个发送调用被网关拒绝（而非单个 token 失败）
//! - `TokenDelivery`：单个 token 投递失败，只记录不上抛

use classroom_shared::error::ClassroomError;
use thiserror::Error;

use crate::gateway::DeliveryErrorKind;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: &'static str, id: String },

    #[error("无效记录: {0}")]
    InvalidRecord(String),

    #[error("推送网关调用失败: {0}")]
    GatewayTransport(String),

    #[error("推送投递失败: token={token}, 类型={kind}")]
    TokenDelivery {
        token: String,
        kind: DeliveryErrorKind,
    },

    #[error("触发事件反序列化失败: {0}")]
    Deserialization(String),

    #[error(transparent)]
    Shared(#[from] ClassroomError),
}

pub type Result<T> = std::result::Result<T, NotifyError>;

impl NotifyError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRecord(reason.into())
    }

    /// 稳定的错误码，用于日志与指标标签
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not-found",
            Self::InvalidRecord(_) => "invalid-record",
            Self::GatewayTransport(_) => "gateway-transport-failure",
            Self::TokenDelivery { .. } => "token-delivery-failure",
            Self::Deserialization(_) => "deserialization-failure",
            Self::Shared(e) => e.code(),
        }
    }

    /// NotFound 对触发流程而言是"无事可做"，调用方据此短路
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Shared(ClassroomError::NotFound { .. })
        )
    }
}

impl From<sqlx::Error> for NotifyError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(ClassroomError::Database(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NotifyError::not_found("class", "class-9");
        assert_eq!(err.to_string(), "记录未找到: class id=class-9");

        let err = NotifyError::invalid("data.grade 不支持嵌套结构");
        assert_eq!(err.to_string(), "无效记录: data.grade 不支持嵌套结构");

        let err = NotifyError::TokenDelivery {
            token: "tok-1".to_string(),
            kind: DeliveryErrorKind::UnregisteredToken,
        };
        assert_eq!(
            err.to_string(),
            "推送投递失败: token=tok-1, 类型=unregistered-token"
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(NotifyError::invalid("x").code(), "invalid-record");
        assert_eq!(
            NotifyError::GatewayTransport("connection reset".to_string()).code(),
            "gateway-transport-failure"
        );
        let shared: NotifyError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(shared.code(), "DATABASE_ERROR");
    }

    #[test]
    fn test_is_not_found() {
        assert!(NotifyError::not_found("user", "u-1").is_not_found());
        assert!(NotifyError::Shared(ClassroomError::not_found("class", "c-1")).is_not_found());
        assert!(!NotifyError::invalid("x").is_not_found());
    }
}
