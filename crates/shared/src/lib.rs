//! 共享库
//!
//! 包含通知服务共用的配置、错误处理、Kafka、重试与可观测性等基础设施代码。

pub mod config;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod retry;
