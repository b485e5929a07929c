//! 文档存储访问层

mod memory;
mod postgres;
mod traits;

use std::sync::Arc;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use traits::{
    ClassRepository, DeliveryFailure, QueueRepository, TaskRepository, UserRepository,
};

#[cfg(test)]
pub use traits::{
    MockClassRepository, MockQueueRepository, MockTaskRepository, MockUserRepository,
};

/// 各集合的仓储句柄
#[derive(Clone)]
pub struct Repositories {
    pub queue: Arc<dyn QueueRepository>,
    pub classes: Arc<dyn ClassRepository>,
    pub users: Arc<dyn UserRepository>,
    pub tasks: Arc<dyn TaskRepository>,
}

impl Repositories {
    /// 同一个存储实现承载全部集合
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: QueueRepository + ClassRepository + UserRepository + TaskRepository + 'static,
    {
        Self {
            queue: store.clone(),
            classes: store.clone(),
            users: store.clone(),
            tasks: store,
        }
    }
}
