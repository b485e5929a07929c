//! 任务到期提醒
//!
//! 扫描 [now, now + 窗口) 内到期且未完成的任务，逐个向班级学生发送提醒。
//! 单个任务的记录无效只跳过该任务；网关整体不可用时扫描中止并返回错误。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use classroom_shared::observability::metrics;
use tracing::{error, info, instrument, warn};

use crate::dispatch::DeliveryReport;
use crate::error::{NotifyError, Result};
use crate::fanout::{FanoutNotifier, FanoutSource};
use crate::store::TaskRepository;

/// 一次扫描的汇总
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReminderSweepReport {
    pub tasks_found: usize,
    pub tasks_failed: usize,
    pub delivery: DeliveryReport,
}

pub struct ReminderScanner {
    tasks: Arc<dyn TaskRepository>,
    fanout: Arc<FanoutNotifier>,
    window: Duration,
}

impl ReminderScanner {
    pub fn new(tasks: Arc<dyn TaskRepository>, fanout: Arc<FanoutNotifier>, window_hours: i64) -> Self {
        Self {
            tasks,
            fanout,
            window: Duration::hours(window_hours),
        }
    }

    pub async fn sweep(&self) -> Result<ReminderSweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// 以给定时间为起点扫描，任务查询失败或网关整体调用失败时返回错误
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<ReminderSweepReport> {
        let due = self.tasks.find_due_tasks(now, now + self.window).await?;
        let mut report = ReminderSweepReport {
            tasks_found: due.len(),
            ..Default::default()
        };

        for task in &due {
            match self.fanout.notify(FanoutSource::TaskReminder(task)).await {
                Ok(delivery) => {
                    report.delivery = report.delivery.merge(delivery);
                }
                Err(e @ NotifyError::GatewayTransport(_)) => {
                    error!(task_id = %task.id, class_id = %task.class_id, error = %e, "推送网关不可用，中止提醒扫描");
                    return Err(e);
                }
                Err(e) => {
                    report.tasks_failed += 1;
                    warn!(task_id = %task.id, class_id = %task.class_id, error = %e, code = e.code(), "任务提醒发送失败，跳过");
                }
            }
        }

        metrics::record_reminder_sweep(report.tasks_found as u64);
        info!(
            tasks_found = report.tasks_found,
            tasks_failed = report.tasks_failed,
            success_count = report.delivery.success_count,
            failure_count = report.delivery.failure_count,
            "到期提醒扫描完成"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchEngine;
    use crate::gateway::{GatewayError, MockPushGateway};
    use crate::models::{ClassRecord, TaskRecord, UserRecord};
    use crate::payload::PayloadBuilder;
    use crate::store::{MemoryStore, MockTaskRepository};

    fn scanner(store: &MemoryStore, gateway: MockPushGateway) -> ReminderScanner {
        let fanout = FanoutNotifier::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            PayloadBuilder::default(),
            Arc::new(DispatchEngine::new(Arc::new(gateway))),
        );
        ReminderScanner::new(Arc::new(store.clone()), Arc::new(fanout), 24)
    }

    fn task(id: &str, class_id: &str, due: DateTime<Utc>) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            class_id: class_id.to_string(),
            title: id.to_string(),
            due_date: Some(due),
            is_completed: false,
        }
    }

    #[tokio::test]
    async fn test_missing_class_does_not_abort_sweep() {
        let now = Utc::now();
        let store = MemoryStore::default();
        store.insert_class(ClassRecord {
            id: "c1".to_string(),
            name: "Física".to_string(),
            student_ids: vec!["s1".to_string()],
            admin_ids: vec![],
        });
        store.insert_user(UserRecord {
            id: "s1".to_string(),
            fcm_token: Some("tok-s1".to_string()),
        });
        store.insert_task(task("orphan", "deleted-class", now + Duration::hours(1)));
        store.insert_task(task("ok", "c1", now + Duration::hours(2)));

        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send_multicast()
            .times(1)
            .returning(|_, tokens| Ok(tokens.iter().map(|_| Ok("m".to_string())).collect()));

        let report = scanner(&store, gateway).sweep_at(now).await.unwrap();
        assert_eq!(report.tasks_found, 2);
        assert_eq!(report.tasks_failed, 0);
        assert_eq!(report.delivery.success_count, 1);
    }

    #[tokio::test]
    async fn test_transport_failure_aborts_sweep() {
        let now = Utc::now();
        let store = MemoryStore::default();
        for class_id in ["c1", "c2"] {
            store.insert_class(ClassRecord {
                id: class_id.to_string(),
                name: class_id.to_string(),
                student_ids: vec![format!("s-{class_id}")],
                admin_ids: vec![],
            });
            store.insert_user(UserRecord {
                id: format!("s-{class_id}"),
                fcm_token: Some(format!("tok-{class_id}")),
            });
        }
        store.insert_task(task("first", "c1", now + Duration::hours(1)));
        store.insert_task(task("second", "c2", now + Duration::hours(2)));

        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send_multicast()
            .times(1)
            .returning(|_, _| Err(GatewayError::Transport("unavailable".to_string())));

        let err = scanner(&store, gateway).sweep_at(now).await.unwrap_err();
        assert!(matches!(err, NotifyError::GatewayTransport(_)));
    }

    #[tokio::test]
    async fn test_invalid_task_is_counted_and_sweep_continues() {
        let now = Utc::now();
        let store = MemoryStore::default();
        store.insert_class(ClassRecord {
            id: "c1".to_string(),
            name: "Biología".to_string(),
            student_ids: vec!["s1".to_string()],
            admin_ids: vec![],
        });
        store.insert_user(UserRecord {
            id: "s1".to_string(),
            fcm_token: Some("tok-s1".to_string()),
        });
        let mut untitled = task("untitled", "c1", now + Duration::hours(1));
        untitled.title = "  ".to_string();
        store.insert_task(untitled);
        store.insert_task(task("ok", "c1", now + Duration::hours(2)));

        let mut gateway = MockPushGateway::new();
        gateway
            .expect_send_multicast()
            .times(1)
            .returning(|_, tokens| Ok(tokens.iter().map(|_| Ok("m".to_string())).collect()));

        let report = scanner(&store, gateway).sweep_at(now).await.unwrap();
        assert_eq!(report.tasks_found, 2);
        assert_eq!(report.tasks_failed, 1);
        assert_eq!(report.delivery.success_count, 1);
    }

    #[tokio::test]
    async fn test_query_uses_window() {
        let now = Utc::now();
        let mut tasks = MockTaskRepository::new();
        tasks
            .expect_find_due_tasks()
            .withf(move |start, end| *start == now && *end == now + Duration::hours(24))
            .times(1)
            .returning(|_, _| Ok(vec![]));

        let store = MemoryStore::default();
        let fanout = FanoutNotifier::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            PayloadBuilder::default(),
            Arc::new(DispatchEngine::new(Arc::new(MockPushGateway::new()))),
        );
        let scanner = ReminderScanner::new(Arc::new(tasks), Arc::new(fanout), 24);

        let report = scanner.sweep_at(now).await.unwrap();
        assert_eq!(report, ReminderSweepReport::default());
    }
}
