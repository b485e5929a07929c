//! 收件人解析
//!
//! 班级 -> 成员 ID -> 设备 token 两级解析。

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{NotifyError, Result};
use crate::models::{Audience, ClassRecord};
use crate::store::{ClassRepository, UserRepository};

/// 已解析的班级及其受众成员
#[derive(Debug, Clone)]
pub struct ResolvedClass {
    pub class: ClassRecord,
    pub members: Vec<String>,
}

pub struct RecipientResolver {
    classes: Arc<dyn ClassRepository>,
}

impl RecipientResolver {
    pub fn new(classes: Arc<dyn ClassRepository>) -> Self {
        Self { classes }
    }

    /// 解析班级成员，班级不存在时返回 NotFound
    pub async fn resolve(&self, class_id: &str, audience: Audience) -> Result<ResolvedClass> {
        let class = self
            .classes
            .get_class(class_id)
            .await?
            .ok_or_else(|| NotifyError::not_found("class", class_id))?;

        let members = class.members(audience);
        debug!(class_id, ?audience, members = members.len(), "班级成员已解析");

        Ok(ResolvedClass { class, members })
    }
}

pub struct TokenResolver {
    users: Arc<dyn UserRepository>,
}

impl TokenResolver {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    /// 把用户 ID 解析为设备 token
    ///
    /// 按存储的批量上限分片查询后合并；没有 token 的用户直接跳过。
    /// 返回的 token 去重、非空，顺序与首次出现顺序一致。
    pub async fn resolve(&self, user_ids: &[String]) -> Result<Vec<String>> {
        let limit = self.users.batch_limit().max(1);
        let mut seen = HashSet::new();
        let mut tokens = Vec::new();

        for chunk in user_ids.chunks(limit) {
            let users = self.users.get_users_by_ids(chunk).await?;
            for token in users.iter().filter_map(|u| u.deliverable_token()) {
                if seen.insert(token.to_string()) {
                    tokens.push(token.to_string());
                }
            }
        }

        debug!(
            users = user_ids.len(),
            tokens = tokens.len(),
            batches = user_ids.len().div_ceil(limit),
            "设备 token 已解析"
        );

        Ok(tokens)
    }
}
