//! 用量账本：计数的唯一真源
//!
//! 存储可插拔（内存 / SQLite）；try_increment 必须对同一 (user, feature) 原子，
//! 这是整个网关唯一的同步点。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;

use super::types::{FeatureType, UsageRecord};
use super::window::UsageWindow;

/// 账本存储故障（与配额拒绝无关）
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("usage storage error: {0}")]
    Storage(String),

    #[error("corrupt usage record: {0}")]
    CorruptRecord(String),

    #[error("usage ledger task failed: {0}")]
    Join(String),
}

/// 用量账本接口
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// 读取当前窗口的记录；不存在或已过期时返回零计数的新记录（不落库）
    async fn get(&self, user_id: &str, feature: FeatureType) -> Result<UsageRecord, QuotaError>;

    /// 原子地「按需滚动窗口 + 未达上限则加一」；已达上限时不修改计数，返回 (false, 当前记录)
    async fn try_increment(
        &self,
        user_id: &str,
        feature: FeatureType,
        limit: u32,
    ) -> Result<(bool, UsageRecord), QuotaError>;
}

/// 内存账本：单把互斥锁覆盖整个检查-递增过程
///
/// 窗口前进后的第一次递增会清掉所有过期记录，条目数不超过当日活跃的 (user, feature) 数。
pub struct InMemoryUsageLedger {
    window: UsageWindow,
    records: Mutex<Records>,
}

#[derive(Default)]
struct Records {
    by_key: HashMap<(String, FeatureType), UsageRecord>,
    /// 上次清理时的窗口起点
    pruned_at: Option<DateTime<Utc>>,
}

impl Records {
    fn prune_expired(&mut self, current: DateTime<Utc>) {
        if self.pruned_at == Some(current) {
            return;
        }
        let before = self.by_key.len();
        self.by_key.retain(|_, r| r.window_start >= current);
        let removed = before - self.by_key.len();
        if removed > 0 {
            tracing::debug!(removed, window_start = %current, "pruned expired usage records");
        }
        self.pruned_at = Some(current);
    }
}

impl InMemoryUsageLedger {
    pub fn new(window: UsageWindow) -> Self {
        Self {
            window,
            records: Mutex::new(Records::default()),
        }
    }

    /// 测试或迁移时直接写入一条记录
    pub async fn seed(&self, record: UsageRecord) {
        let key = (record.user_id.clone(), record.feature);
        self.records.lock().await.by_key.insert(key, record);
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.records.lock().await.by_key.len()
    }
}

#[async_trait]
impl UsageLedger for InMemoryUsageLedger {
    async fn get(&self, user_id: &str, feature: FeatureType) -> Result<UsageRecord, QuotaError> {
        let records = self.records.lock().await;
        let record = match records.by_key.get(&(user_id.to_string(), feature)) {
            Some(r) => self.window.roll(r.clone()),
            None => self.window.fresh_record(user_id, feature),
        };
        Ok(record)
    }

    async fn try_increment(
        &self,
        user_id: &str,
        feature: FeatureType,
        limit: u32,
    ) -> Result<(bool, UsageRecord), QuotaError> {
        let mut records = self.records.lock().await;
        records.prune_expired(self.window.current_start());
        let key = (user_id.to_string(), feature);
        let mut record = match records.by_key.get(&key) {
            Some(r) => self.window.roll(r.clone()),
            None => self.window.fresh_record(user_id, feature),
        };
        if record.count >= limit {
            return Ok((false, record));
        }
        record.count += 1;
        records.by_key.insert(key, record.clone());
        Ok((true, record))
    }
}
