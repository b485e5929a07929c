//! 投递引擎
//!
//! 无状态地调用推送网关并把结果整理为逐 token 的 `DeliveryOutcome`。
//! 队列路径上由引擎把结果写回原始记录；扇出路径只汇总计数。

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use classroom_shared::observability::metrics;
use tracing::{debug, info, warn};

use crate::error::{NotifyError, Result};
use crate::gateway::{DeliveryErrorKind, GatewayError, PushGateway};
use crate::payload::Message;
use crate::store::{DeliveryFailure, QueueRepository};

/// 单个 token 的投递结果
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub token: String,
    pub message_id: Option<String>,
    pub error: Option<GatewayError>,
}

impl DeliveryOutcome {
    fn from_result(token: &str, result: std::result::Result<String, GatewayError>) -> Self {
        match result {
            Ok(message_id) => Self {
                token: token.to_string(),
                message_id: Some(message_id),
                error: None,
            },
            Err(error) => Self {
                token: token.to_string(),
                message_id: None,
                error: Some(error),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<DeliveryErrorKind> {
        self.error.as_ref().map(GatewayError::kind)
    }

    /// 失败时转为错误值，便于在日志中统一展示
    pub fn to_error(&self) -> Option<NotifyError> {
        self.error_kind().map(|kind| NotifyError::TokenDelivery {
            token: self.token.clone(),
            kind,
        })
    }
}

/// 多目标投递汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub success_count: usize,
    pub failure_count: usize,
}

impl DeliveryReport {
    pub fn from_outcomes(outcomes: &[DeliveryOutcome]) -> Self {
        let success_count = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            success_count,
            failure_count: outcomes.len() - success_count,
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            success_count: self.success_count + other.success_count,
            failure_count: self.failure_count + other.failure_count,
        }
    }
}

pub struct DispatchEngine {
    gateway: Arc<dyn PushGateway>,
}

impl DispatchEngine {
    pub fn new(gateway: Arc<dyn PushGateway>) -> Self {
        Self { gateway }
    }

    /// 单 token 发送，失败体现在返回值中
    pub async fn send_one(&self, message: &Message, token: &str) -> DeliveryOutcome {
        let started = Instant::now();
        let result = self.gateway.send(message, token).await;
        metrics::record_dispatch_duration(message.kind.as_str(), started.elapsed().as_secs_f64());

        let outcome = DeliveryOutcome::from_result(token, result);
        let status = if outcome.is_success() { "success" } else { "failure" };
        metrics::record_push_delivery(message.kind.as_str(), status, 1);

        outcome
    }

    /// 多 token 发送
    ///
    /// 结果与 `tokens` 等长且顺序一致。只有整个调用失败时返回 GatewayTransport，
    /// 所有 token 都因传输失败时同样视为整个调用失败。
    pub async fn send_many(
        &self,
        message: &Message,
        tokens: &[String],
    ) -> Result<Vec<DeliveryOutcome>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let kind = message.kind.as_str();
        let started = Instant::now();
        let results = self
            .gateway
            .send_multicast(message, tokens)
            .await
            .map_err(|e| NotifyError::GatewayTransport(e.to_string()))?;
        metrics::record_dispatch_duration(kind, started.elapsed().as_secs_f64());

        if results.len() != tokens.len() {
            return Err(NotifyError::GatewayTransport(format!(
                "网关返回 {} 个结果，期望 {}",
                results.len(),
                tokens.len()
            )));
        }

        if results
            .iter()
            .all(|r| matches!(r, Err(GatewayError::Transport(_))))
        {
            let reason = results
                .into_iter()
                .find_map(|r| r.err())
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(NotifyError::GatewayTransport(reason));
        }

        let outcomes: Vec<DeliveryOutcome> = tokens
            .iter()
            .zip(results)
            .map(|(token, result)| DeliveryOutcome::from_result(token, result))
            .collect();

        for outcome in outcomes.iter().filter(|o| !o.is_success()) {
            // TODO: unregistered/malformed 的 token 应从用户记录中清理
            warn!(
                token = %outcome.token,
                error_kind = %outcome.error_kind().unwrap_or(DeliveryErrorKind::Unknown),
                kind,
                "推送到 token 失败"
            );
        }

        let report = DeliveryReport::from_outcomes(&outcomes);
        metrics::record_push_delivery(kind, "success", report.success_count as u64);
        metrics::record_push_delivery(kind, "failure", report.failure_count as u64);

        Ok(outcomes)
    }

    /// 发送队列记录并写回投递状态
    pub async fn deliver_queue_entry(
        &self,
        queue: &dyn QueueRepository,
        entry_id: &str,
        message: &Message,
        token: &str,
    ) -> Result<DeliveryOutcome> {
        let outcome = self.send_one(message, token).await;
        let now = Utc::now();

        match (&outcome.message_id, &outcome.error) {
            (Some(message_id), _) => {
                if queue.mark_sent(entry_id, message_id, now).await? {
                    info!(entry_id, message_id = %message_id, "队列通知已发送");
                } else {
                    warn!(entry_id, message_id = %message_id, "队列记录已被其他调用处理，未写回");
                }
            }
            (None, Some(error)) => {
                let failure = DeliveryFailure {
                    message: error.to_string(),
                    code: error.kind().as_str().to_string(),
                    details: error.code().map(str::to_string),
                };
                queue.mark_failed(entry_id, &failure, now).await?;
                debug!(entry_id, code = %failure.code, "队列记录已写入错误状态");
            }
            (None, None) => {}
        }

        Ok(outcome)
    }
}
