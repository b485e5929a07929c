//! FCM 访问令牌
//!
//! 生产环境使用服务账号私钥签发 RS256 JWT，换取 OAuth2 access token 并缓存到过期前一分钟。
//! 本地调试可以直接配置静态 token。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use classroom_shared::retry::{RetryPolicy, retry_with_policy};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{DeliveryErrorKind, GatewayError};

const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// access token 来源
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, GatewayError>;
}

/// 固定 token，不刷新
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String, GatewayError> {
        Ok(self.token.clone())
    }
}

/// 服务账号密钥文件（只读取需要的字段）
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn from_file(path: &str) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::rejected(
                DeliveryErrorKind::Authentication,
                "CREDENTIALS_UNREADABLE",
                format!("{path}: {e}"),
            )
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            GatewayError::rejected(
                DeliveryErrorKind::Authentication,
                "CREDENTIALS_INVALID",
                format!("{path}: {e}"),
            )
        })
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// 服务账号换取的 OAuth2 token，带缓存
pub struct ServiceAccountTokenSource {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
    cached: Mutex<Option<CachedToken>>,
}

impl ServiceAccountTokenSource {
    pub fn new(key: ServiceAccountKey, client: reqwest::Client) -> Result<Self, GatewayError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
            GatewayError::rejected(
                DeliveryErrorKind::Authentication,
                "CREDENTIALS_INVALID",
                format!("服务账号私钥无法解析: {e}"),
            )
        })?;

        Ok(Self {
            key,
            encoding_key,
            client,
            retry_policy: RetryPolicy::default(),
            cached: Mutex::new(None),
        })
    }

    fn cached_token(&self) -> Option<String> {
        let cached = self.cached.lock();
        cached
            .as_ref()
            .filter(|c| Instant::now() < c.refresh_at)
            .map(|c| c.token.clone())
    }

    fn sign_assertion(&self) -> Result<String, GatewayError> {
        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: FCM_SCOPE,
            aud: self.key.token_uri(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key).map_err(
            |e| {
                GatewayError::rejected(
                    DeliveryErrorKind::Authentication,
                    "ASSERTION_SIGNING_FAILED",
                    e.to_string(),
                )
            },
        )
    }

    async fn exchange(&self) -> Result<TokenResponse, GatewayError> {
        let assertion = self.sign_assertion()?;
        let response = self
            .client
            .post(self.key.token_uri())
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("OAuth 请求失败: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::Transport(format!("OAuth 服务返回 {status}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::rejected(
                DeliveryErrorKind::Authentication,
                status.as_str(),
                body,
            ));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| GatewayError::Transport(format!("OAuth 响应解析失败: {e}")))
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountTokenSource {
    async fn access_token(&self) -> Result<String, GatewayError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        let response = retry_with_policy(
            &self.retry_policy,
            "fcm_oauth_exchange",
            GatewayError::is_transport,
            || self.exchange(),
        )
        .await?;

        let lifetime = Duration::from_secs(response.expires_in).saturating_sub(REFRESH_MARGIN);
        *self.cached.lock() = Some(CachedToken {
            token: response.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        info!(
            client_email = %self.key.client_email,
            expires_in = response.expires_in,
            "FCM access token 已刷新"
        );
        debug!(refresh_in_secs = lifetime.as_secs(), "下次刷新时间");

        Ok(response.access_token)
    }
}
