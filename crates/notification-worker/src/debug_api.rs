//! 调试 HTTP 接口
//!
//! 向指定用户的设备发送一条测试推送，用于联调 token 与推送配置。
//! 默认关闭，通过 `server.debug_api_enabled` 开启。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::dispatch::DispatchEngine;
use crate::payload::{PayloadBuilder, PayloadSource};
use crate::store::UserRepository;

pub struct DebugApiState {
    users: Arc<dyn UserRepository>,
    builder: PayloadBuilder,
    engine: Arc<DispatchEngine>,
}

impl DebugApiState {
    pub fn new(
        users: Arc<dyn UserRepository>,
        builder: PayloadBuilder,
        engine: Arc<DispatchEngine>,
    ) -> Self {
        Self {
            users,
            builder,
            engine,
        }
    }
}

/// 测试推送请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNotificationRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

pub fn debug_routes() -> Router<Arc<DebugApiState>> {
    Router::new()
        .route("/test-notification", post(send_test_notification))
        .route("/health", get(health))
}

pub fn router(state: Arc<DebugApiState>) -> Router {
    debug_routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// 启动调试接口，直到收到 shutdown 信号
pub async fn serve(
    addr: SocketAddr,
    state: Arc<DebugApiState>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "调试接口已启动");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn send_test_notification(
    State(state): State<Arc<DebugApiState>>,
    Json(req): Json<TestNotificationRequest>,
) -> impl IntoResponse {
    let Some(user_id) = req.user_id.as_deref().filter(|id| !id.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "userId is required" })),
        );
    };

    let user = match state.users.get_user(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "User not found" })),
            );
        }
        Err(e) => {
            error!(user_id, error = %e, "查询用户失败");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string(), "code": e.code() })),
            );
        }
    };

    let Some(token) = user.deliverable_token() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "User has no FCM token" })),
        );
    };

    let message = match state.builder.build(
        PayloadSource::Test {
            title: req.title.as_deref(),
            body: req.body.as_deref(),
        },
        Utc::now(),
    ) {
        Ok(message) => message,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string(), "code": e.code() })),
            );
        }
    };

    let outcome = state.engine.send_one(&message, token).await;
    match (outcome.message_id, outcome.error) {
        (Some(message_id), _) => {
            info!(user_id, message_id = %message_id, "测试推送已发送");
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "messageId": message_id,
                    "message": "Test notification sent",
                })),
            )
        }
        (None, error) => {
            let error_kind = error.as_ref().map(|e| e.kind().as_str()).unwrap_or("unknown");
            warn!(user_id, error_kind, "测试推送发送失败");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": error.as_ref().map(ToString::to_string).unwrap_or_default(),
                    "code": error_kind,
                    "details": error.as_ref().and_then(|e| e.code()),
                })),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::gateway::{DeliveryErrorKind, GatewayError, MockPushGateway};
    use crate::models::UserRecord;
    use crate::store::MemoryStore;

    fn create_test_app(gateway: MockPushGateway) -> Router {
        let store = MemoryStore::default();
        store.insert_user(UserRecord {
            id: "with-token".to_string(),
            fcm_token: Some("tok-1".to_string()),
        });
        store.insert_user(UserRecord {
            id: "no-token".to_string(),
            fcm_token: None,
        });

        router(Arc::new(DebugApiState::new(
            Arc::new(store),
            PayloadBuilder::default(),
            Arc::new(DispatchEngine::new(Arc::new(gateway))),
        )))
    }

    async fn post_json(app: Router, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/test-notification")
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_missing_user_id() {
        let (status, body) = post_json(create_test_app(MockPushGateway::new()), json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "userId is required");
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (status, _) = post_json(
            create_test_app(MockPushGateway::new()),
            json!({ "userId": "ghost" }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_user_without_token() {
        let (status, body) = post_json(
            create_test_app(MockPushGateway::new()),
            json!({ "userId": "no-token" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "User has no FCM token");
    }

    #[tokio::test]
    async fn test_send_with_defaults() {
        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send()
            .withf(|message, token| {
                token == "tok-1"
                    && message.title == "🧪 Test notification"
                    && message.data["type"] == "test"
            })
            .times(1)
            .returning(|_, _| Ok("projects/p/messages/42".to_string()));

        let (status, body) =
            post_json(create_test_app(gateway), json!({ "userId": "with-token" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["messageId"], "projects/p/messages/42");
    }

    #[tokio::test]
    async fn test_gateway_failure() {
        let mut gateway = MockPushGateway::new();
        gateway.expect_send().returning(|_, _| {
            Err(GatewayError::rejected(
                DeliveryErrorKind::UnregisteredToken,
                "UNREGISTERED",
                "Requested entity was not found.",
            ))
        });

        let (status, body) = post_json(
            create_test_app(gateway),
            json!({ "userId": "with-token", "title": "Hola" }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "unregistered-token");
        assert_eq!(body["details"], "UNREGISTERED");
    }
}
