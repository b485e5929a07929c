//! 模拟推送网关
//!
//! 只记录日志并返回随机 message id，便于在没有 FCM 凭证的环境中验证整条触发管道。

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use super::{GatewayError, PushGateway, TokenResult};
use crate::payload::Message;

#[derive(Debug, Default, Clone)]
pub struct LogGateway;

impl LogGateway {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PushGateway for LogGateway {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, message: &Message, token: &str) -> Result<String, GatewayError> {
        let message_id = Uuid::now_v7().to_string();

        info!(
            gateway = "log",
            kind = message.kind.as_str(),
            token = %token,
            message_id = %message_id,
            title = %message.title,
            "模拟发送推送通知"
        );

        Ok(message_id)
    }

    async fn send_multicast(
        &self,
        message: &Message,
        tokens: &[String],
    ) -> Result<Vec<TokenResult>, GatewayError> {
        info!(
            gateway = "log",
            kind = message.kind.as_str(),
            token_count = tokens.len(),
            title = %message.title,
            "模拟多播推送通知"
        );

        Ok(tokens
            .iter()
            .map(|_| Ok(Uuid::now_v7().to_string()))
            .collect())
    }
}
