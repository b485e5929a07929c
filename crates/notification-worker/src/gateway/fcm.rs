//! FCM HTTP v1 网关
//!
//! 每个 token 一次 `messages:send` 请求。多播在同一个 access token 下并发请求，
//! 并用有序缓冲保证结果与输入 token 一一对应。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use classroom_shared::config::PushConfig;
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use super::auth::{AccessTokenSource, ServiceAccountKey, ServiceAccountTokenSource, StaticTokenSource};
use super::{DeliveryErrorKind, GatewayError, PushGateway, TokenResult};
use crate::payload::Message;

pub struct FcmGateway {
    client: reqwest::Client,
    send_url: String,
    token_source: Arc<dyn AccessTokenSource>,
    max_concurrency: usize,
}

impl FcmGateway {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        project_id: &str,
        token_source: Arc<dyn AccessTokenSource>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            client,
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                endpoint.trim_end_matches('/'),
                project_id
            ),
            token_source,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// 按推送配置创建网关
    ///
    /// 静态 access token 优先；否则读取服务账号密钥文件。
    /// project_id 未配置时使用密钥文件中的值。
    pub fn from_config(config: &PushConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| GatewayError::Transport(format!("HTTP 客户端创建失败: {e}")))?;

        let mut project_id = config.project_id.clone();
        let token_source: Arc<dyn AccessTokenSource> = match (
            config.access_token.as_deref(),
            config.credentials_path.as_deref(),
        ) {
            (Some(token), _) => Arc::new(StaticTokenSource::new(token)),
            (None, Some(path)) => {
                let key = ServiceAccountKey::from_file(path)?;
                if project_id.is_empty() {
                    project_id = key.project_id.clone().unwrap_or_default();
                }
                Arc::new(ServiceAccountTokenSource::new(key, client.clone())?)
            }
            (None, None) => {
                return Err(GatewayError::rejected(
                    DeliveryErrorKind::Authentication,
                    "CREDENTIALS_MISSING",
                    "push.access_token 与 push.credentials_path 均未配置",
                ));
            }
        };

        if project_id.is_empty() {
            return Err(GatewayError::rejected(
                DeliveryErrorKind::Authentication,
                "PROJECT_ID_MISSING",
                "push.project_id 未配置",
            ));
        }

        info!(project_id = %project_id, endpoint = %config.endpoint, "FCM 网关已初始化");

        Ok(Self::new(
            client,
            &config.endpoint,
            &project_id,
            token_source,
            config.max_concurrency,
        ))
    }

    async fn post(&self, message: &Message, token: &str, access_token: &str) -> TokenResult {
        let response = self
            .client
            .post(&self.send_url)
            .bearer_auth(access_token)
            .json(&request_body(message, token))
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let sent: SendResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::Transport(format!("FCM 响应解析失败: {e}")))?;
            debug!(message_id = %sent.name, "FCM 接受了消息");
            return Ok(sent.name);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status, &body))
    }
}

#[async_trait]
impl PushGateway for FcmGateway {
    fn name(&self) -> &str {
        "fcm"
    }

    async fn send(&self, message: &Message, token: &str) -> Result<String, GatewayError> {
        let access_token = self.token_source.access_token().await?;
        self.post(message, token, &access_token).await
    }

    async fn send_multicast(
        &self,
        message: &Message,
        tokens: &[String],
    ) -> Result<Vec<TokenResult>, GatewayError> {
        let access_token = self.token_source.access_token().await?;
        let access_token = access_token.as_str();

        let requests: Vec<_> = tokens
            .iter()
            .map(|token| self.post(message, token, access_token).boxed())
            .collect();

        let results = stream::iter(requests)
            .buffered(self.max_concurrency)
            .collect::<Vec<_>>()
            .await;

        Ok(results)
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default, rename = "errorCode")]
    error_code: Option<String>,
}

/// 把 FCM 错误响应转为网关错误
///
/// 优先使用 `details[].errorCode`，其次 `status`，都缺失时按 HTTP 状态码归类。
fn classify_error(status: StatusCode, body: &str) -> GatewayError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let ErrorStatus {
        message,
        status: rpc_status,
        details,
    } = envelope.error;

    let (code, classified) = match details.into_iter().find_map(|d| d.error_code) {
        Some(code) => {
            let kind = DeliveryErrorKind::from_fcm_code(&code);
            (code, kind)
        }
        None if !rpc_status.is_empty() => {
            let kind = DeliveryErrorKind::from_fcm_status(&rpc_status);
            (rpc_status, kind)
        }
        None => (status.as_str().to_string(), DeliveryErrorKind::Unknown),
    };

    let kind = match classified {
        DeliveryErrorKind::Unknown if status.is_server_error() => DeliveryErrorKind::Transient,
        DeliveryErrorKind::Unknown if status == StatusCode::TOO_MANY_REQUESTS => {
            DeliveryErrorKind::QuotaExceeded
        }
        DeliveryErrorKind::Unknown
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
        {
            DeliveryErrorKind::Authentication
        }
        kind => kind,
    };

    let message = if message.is_empty() {
        format!("HTTP {status}")
    } else {
        message
    };

    GatewayError::rejected(kind, code, message)
}

/// 组装 `messages:send` 请求体
fn request_body(message: &Message, token: &str) -> Value {
    let android = &message.hints.android;
    let apns = &message.hints.apns;

    let mut android_json = Map::new();
    android_json.insert(
        "priority".into(),
        json!(if android.high_priority { "HIGH" } else { "NORMAL" }),
    );
    if let Some(ttl) = android.ttl_secs {
        android_json.insert("ttl".into(), json!(format!("{ttl}s")));
    }
    if let Some(collapse_key) = &android.collapse_key {
        android_json.insert("collapse_key".into(), json!(collapse_key));
    }
    android_json.insert(
        "notification".into(),
        json!({
            "channel_id": android.channel_id,
            "sound": android.sound,
            "notification_priority": if android.high_priority { "PRIORITY_HIGH" } else { "PRIORITY_DEFAULT" },
            "visibility": if android.public_visibility { "PUBLIC" } else { "PRIVATE" },
            "default_sound": android.default_sound,
            "default_vibrate_timings": android.default_vibrate_timings,
        }),
    );

    let mut headers = Map::new();
    headers.insert("apns-priority".into(), json!(apns.priority.to_string()));
    if let Some(push_type) = &apns.push_type {
        headers.insert("apns-push-type".into(), json!(push_type));
    }

    let mut aps = Map::new();
    if apns.alert {
        aps.insert(
            "alert".into(),
            json!({ "title": message.title, "body": message.body }),
        );
    }
    aps.insert("sound".into(), json!(apns.sound));
    if let Some(badge) = apns.badge {
        aps.insert("badge".into(), json!(badge));
    }
    if apns.content_available {
        aps.insert("content-available".into(), json!(1));
    }
    if apns.mutable_content {
        aps.insert("mutable-content".into(), json!(1));
    }

    json!({
        "message": {
            "token": token,
            "notification": { "title": message.title, "body": message.body },
            "data": message.data,
            "android": android_json,
            "apns": { "headers": headers, "payload": { "aps": aps } },
        }
    })
}
