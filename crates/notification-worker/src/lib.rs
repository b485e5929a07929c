//! 课堂推送通知服务
//!
//! 把记录创建事件扇出为设备推送：队列记录单发并回写投递状态，
//! 任务/活动按班级成员多播，定时扫描到期任务发送提醒，并定期清理已发送的队列记录。

pub mod consumer;
pub mod debug_api;
pub mod dispatch;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod models;
pub mod payload;
pub mod queue;
pub mod recipients;
pub mod reminder;
pub mod retention;
pub mod scheduler;
pub mod store;
pub mod triggers;
