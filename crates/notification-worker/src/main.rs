//! 课堂推送通知服务
//!
//! 消费记录创建事件（通知队列、任务、活动）并推送到学生和老师的设备，
//! 同时按定时器执行到期提醒和已发送记录清理。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use classroom_shared::config::{AppConfig, PushMode, StoreBackend};
use classroom_shared::observability;
use notification_worker::consumer::DocumentConsumer;
use notification_worker::debug_api::{self, DebugApiState};
use notification_worker::dispatch::DispatchEngine;
use notification_worker::gateway::{FcmGateway, LogGateway, PushGateway};
use notification_worker::payload::PayloadBuilder;
use notification_worker::scheduler::TimerScheduler;
use notification_worker::store::{MemoryStore, PgStore, Repositories};
use notification_worker::triggers::NotificationHandlers;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "notification-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, load_error) = match AppConfig::load(SERVICE_NAME) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    let _guard = observability::init(SERVICE_NAME, &config.observability).await?;
    if let Some(e) = load_error {
        warn!(error = %e, "配置加载失败，使用默认配置");
    }

    info!(
        environment = %config.environment,
        push_mode = ?config.push.mode,
        store = ?config.delivery.store,
        "Starting notification-worker..."
    );

    let (repos, pg_store, mirror) = match config.delivery.store {
        StoreBackend::Postgres => {
            let store = Arc::new(
                PgStore::connect(&config.database, config.delivery.token_batch_size)
                    .await
                    .context("连接数据库失败")?,
            );
            (Repositories::from_store(store.clone()), Some(store), None)
        }
        StoreBackend::Memory => {
            warn!("使用内存存储，数据不会持久化，记录从 Kafka 同步");
            let store = MemoryStore::new(config.delivery.token_batch_size);
            (Repositories::from_store(Arc::new(store.clone())), None, Some(store))
        }
    };

    let gateway: Arc<dyn PushGateway> = match config.push.mode {
        PushMode::Fcm => Arc::new(FcmGateway::from_config(&config.push).context("初始化 FCM 网关失败")?),
        PushMode::Log => {
            warn!("推送网关为 log 模式，不会真正发送推送");
            Arc::new(LogGateway::new())
        }
    };

    let handlers = Arc::new(NotificationHandlers::new(
        &repos,
        gateway.clone(),
        &config.push,
        &config.delivery,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let timers = TimerScheduler::new(handlers.clone(), &config.delivery)
        .context("定时器配置无效")?
        .spawn(shutdown_rx.clone());

    let debug_server = if config.server.debug_api_enabled {
        let addr: SocketAddr = config
            .server_addr()
            .parse()
            .context("server.host/port 无效")?;
        let state = Arc::new(DebugApiState::new(
            repos.users.clone(),
            PayloadBuilder::from_config(&config.push),
            Arc::new(DispatchEngine::new(gateway)),
        ));
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = debug_api::serve(addr, state, shutdown).await {
                error!(error = %e, "调试接口异常退出");
            }
        }))
    } else {
        None
    };

    let mut consumer = DocumentConsumer::new(&config.kafka, handlers).context("创建 Kafka 消费者失败")?;
    if let Some(store) = mirror {
        consumer = consumer.with_mirror(&config.kafka, store);
    }
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("收到关闭信号，正在停止...");
    let _ = shutdown_tx.send(true);

    match consumer_handle.await {
        Ok(Err(e)) => error!(error = %e, "Kafka 消费者异常退出"),
        Err(e) => error!(error = %e, "Kafka 消费任务 panic"),
        Ok(Ok(())) => {}
    }
    for timer in timers {
        let _ = timer.await;
    }
    if let Some(server) = debug_server {
        let _ = server.await;
    }
    if let Some(store) = pg_store {
        store.close().await;
    }

    info!("notification-worker 已停止");
    Ok(())
}
