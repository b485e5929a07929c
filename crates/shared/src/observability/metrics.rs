//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时所有记录函数都是空操作，单元测试无需初始化。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出，在指定端口暴露 `/metrics`
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_metrics();
    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

fn describe_metrics() {
    metrics::describe_counter!(
        "push_deliveries_total",
        "Push deliveries per token, by message kind and status"
    );
    metrics::describe_histogram!(
        "push_dispatch_duration_seconds",
        "Gateway round-trip duration per dispatch call"
    );
    metrics::describe_counter!(
        "queue_entries_processed_total",
        "Queue entries handled, by outcome"
    );
    metrics::describe_counter!(
        "retention_deleted_total",
        "Sent queue entries removed by the retention sweep"
    );
    metrics::describe_counter!(
        "reminder_tasks_total",
        "Tasks found by the due-date reminder sweep"
    );
    metrics::describe_counter!("trigger_invocations_total", "Trigger invocations, by status");
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server error");
        }
    }))
}

// ============================================================================
// 记录函数
// ============================================================================

/// 记录按 token 计的投递结果
#[inline]
pub fn record_push_delivery(kind: &str, status: &str, count: u64) {
    metrics::counter!(
        "push_deliveries_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(count);
}

/// 记录一次网关调用耗时
#[inline]
pub fn record_dispatch_duration(kind: &str, duration_secs: f64) {
    metrics::histogram!("push_dispatch_duration_seconds", "kind" => kind.to_string())
        .record(duration_secs);
}

/// 记录队列记录处理结果（sent / failed / skipped）
#[inline]
pub fn record_queue_entry(outcome: &str) {
    metrics::counter!("queue_entries_processed_total", "outcome" => outcome.to_string())
        .increment(1);
}

#[inline]
pub fn record_retention_deleted(count: u64) {
    metrics::counter!("retention_deleted_total").increment(count);
}

#[inline]
pub fn record_reminder_sweep(tasks: u64) {
    metrics::counter!("reminder_tasks_total").increment(tasks);
}

/// 记录触发器调用结果
#[inline]
pub fn record_trigger(trigger: &str, status: &str) {
    metrics::counter!(
        "trigger_invocations_total",
        "trigger" => trigger.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        record_push_delivery("task_created", "success", 3);
        record_dispatch_duration("queue_direct", 0.12);
        record_queue_entry("sent");
        record_retention_deleted(5);
        record_reminder_sweep(2);
        record_trigger("queue_entry_created", "ok");
    }
}
