//! 定时触发
//!
//! 按 cron 表达式驱动每日保留期清理和每小时到期提醒。
//! 每个定时器一个循环：计算下次触发时间，睡眠到点后同步执行，执行期间不会重入。

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use classroom_shared::config::DeliveryConfig;
use classroom_shared::error::ClassroomError;
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::triggers::{NotificationHandlers, TriggerKind};

/// 单个定时任务
#[derive(Debug, Clone)]
pub struct TimerJob {
    pub kind: TriggerKind,
    schedule: Schedule,
}

impl TimerJob {
    pub fn new(kind: TriggerKind, cron_expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(cron_expression).map_err(|e| {
            ClassroomError::Validation(format!(
                "{} 的 cron 表达式无效 '{cron_expression}': {e}",
                kind.as_str()
            ))
        })?;
        Ok(Self { kind, schedule })
    }

    /// 给定时间之后的下一个触发时间
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

pub struct TimerScheduler {
    handlers: Arc<NotificationHandlers>,
    jobs: Vec<TimerJob>,
}

impl TimerScheduler {
    pub fn new(handlers: Arc<NotificationHandlers>, config: &DeliveryConfig) -> Result<Self> {
        let jobs = vec![
            TimerJob::new(TriggerKind::DailyRetentionSweep, &config.retention_cron)?,
            TimerJob::new(TriggerKind::HourlyReminderSweep, &config.reminder_cron)?,
        ];
        Ok(Self { handlers, jobs })
    }

    /// 为每个定时任务启动独立循环
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|job| {
                let handlers = self.handlers.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(run_job(job, handlers, shutdown))
            })
            .collect()
    }
}

async fn run_job(job: TimerJob, handlers: Arc<NotificationHandlers>, mut shutdown: watch::Receiver<bool>) {
    let trigger = job.kind.as_str();
    info!(trigger, "定时器已启动");

    loop {
        let now = Utc::now();
        let Some(next) = job.next_after(now) else {
            error!(trigger, "cron 表达式没有下次执行时间，定时器退出");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        info!(trigger, next_run = %next, "等待下次触发");

        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }

            _ = tokio::time::sleep(wait) => {
                handlers.run_timer(job.kind).await;
            }
        }
    }

    info!(trigger, "定时器已停止");
}
