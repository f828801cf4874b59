//! 功能闸门：把账本计数转为配额判定
//!
//! 拒绝不是错误：consume 返回 allowed=false，调用方按判定分支；只有存储故障才返回 Err。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::ledger::{QuotaError, UsageLedger};
use super::types::{FeatureQuota, FeatureType, QuotaDecision};
use crate::config::QuotaLimitsSection;

/// 各功能每日上限（运行时可调）
#[derive(Debug)]
pub struct QuotaLimits {
    limits: RwLock<HashMap<FeatureType, u32>>,
}

impl QuotaLimits {
    pub fn new(limits: HashMap<FeatureType, u32>) -> Self {
        Self {
            limits: RwLock::new(limits),
        }
    }

    pub fn from_config(section: &QuotaLimitsSection) -> Self {
        Self::new(Self::map_from_config(section))
    }

    fn map_from_config(section: &QuotaLimitsSection) -> HashMap<FeatureType, u32> {
        FeatureType::ALL
            .iter()
            .map(|f| (*f, section.limit_for(*f)))
            .collect()
    }

    /// 未配置的功能视为 0（全部拒绝）
    pub async fn get(&self, feature: FeatureType) -> u32 {
        self.limits.read().await.get(&feature).copied().unwrap_or(0)
    }

    pub async fn set(&self, feature: FeatureType, limit: u32) {
        self.limits.write().await.insert(feature, limit);
    }

    /// 热更新：整体替换
    pub async fn replace_all(&self, section: &QuotaLimitsSection) {
        *self.limits.write().await = Self::map_from_config(section);
    }
}

pub struct FeatureGate {
    ledger: Arc<dyn UsageLedger>,
    limits: Arc<QuotaLimits>,
}

impl FeatureGate {
    pub fn new(ledger: Arc<dyn UsageLedger>, limits: Arc<QuotaLimits>) -> Self {
        Self { ledger, limits }
    }

    pub fn limits(&self) -> &Arc<QuotaLimits> {
        &self.limits
    }

    /// 只读查询：还剩多少
    pub async fn evaluate(
        &self,
        user_id: &str,
        feature: FeatureType,
    ) -> Result<QuotaDecision, QuotaError> {
        let limit = self.limits.get(feature).await;
        let record = self.ledger.get(user_id, feature).await?;
        let remaining = limit.saturating_sub(record.count);
        Ok(QuotaDecision {
            allowed: remaining > 0,
            remaining,
            limit,
            reset_at: record.reset_at(),
        })
    }

    /// 原子地消耗一个单位
    pub async fn consume(
        &self,
        user_id: &str,
        feature: FeatureType,
    ) -> Result<QuotaDecision, QuotaError> {
        let limit = self.limits.get(feature).await;
        let (success, record) = self.ledger.try_increment(user_id, feature, limit).await?;
        let decision = QuotaDecision {
            allowed: success,
            remaining: if success {
                limit.saturating_sub(record.count)
            } else {
                0
            },
            limit,
            reset_at: record.reset_at(),
        };
        tracing::debug!(
            user_id,
            feature = %feature,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "quota consume"
        );
        Ok(decision)
    }

    /// 所有功能的配额快照
    pub async fn snapshot(
        &self,
        user_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<FeatureQuota>, QuotaError> {
        let mut out = Vec::with_capacity(FeatureType::ALL.len());
        for feature in FeatureType::ALL {
            let decision = self.evaluate(user_id, feature).await?;
            out.push(FeatureQuota {
                feature_type: feature,
                reset_in: decision.reset_in(now),
                decision,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use chrono_tz::Tz;

    use super::*;
    use crate::quota::ledger::InMemoryUsageLedger;
    use crate::quota::window::{Clock, ManualClock, UsageWindow};

    fn gate(limit: u32) -> (FeatureGate, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap());
        let window = UsageWindow::new(Tz::UTC, Arc::new(clock.clone()));
        let ledger = Arc::new(InMemoryUsageLedger::new(window));
        let limits = Arc::new(QuotaLimits::new(HashMap::from([
            (FeatureType::QuickChat, limit),
            (FeatureType::StructuredAnalysis, 2),
        ])));
        (FeatureGate::new(ledger, limits), clock)
    }

    #[tokio::test]
    async fn test_consume_counts_down_then_denies() {
        let (gate, _) = gate(3);
        let mut remaining = Vec::new();
        for _ in 0..3 {
            let d = gate.consume("u1", FeatureType::QuickChat).await.unwrap();
            assert!(d.allowed);
            remaining.push(d.remaining);
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = gate.consume("u1", FeatureType::QuickChat).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 3);
        assert_eq!(denied.reset_at, Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_evaluate_does_not_consume() {
        let (gate, _) = gate(3);
        for _ in 0..5 {
            let d = gate.evaluate("u1", FeatureType::QuickChat).await.unwrap();
            assert_eq!(d.remaining, 3);
            assert!(d.allowed);
        }
    }

    #[tokio::test]
    async fn test_unconfigured_feature_denied() {
        let (gate, _) = gate(3);
        let d = gate.consume("u1", FeatureType::DocumentGeneration).await.unwrap();
        assert!(!d.allowed);
        assert_eq!(d.limit, 0);
    }

    #[tokio::test]
    async fn test_runtime_limit_change() {
        let (gate, _) = gate(1);
        assert!(gate.consume("u1", FeatureType::QuickChat).await.unwrap().allowed);
        assert!(!gate.consume("u1", FeatureType::QuickChat).await.unwrap().allowed);

        gate.limits().set(FeatureType::QuickChat, 3).await;
        let d = gate.consume("u1", FeatureType::QuickChat).await.unwrap();
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);

        // 调低到已用量以下：剩余为 0 而非溢出
        gate.limits().set(FeatureType::QuickChat, 1).await;
        let d = gate.evaluate("u1", FeatureType::QuickChat).await.unwrap();
        assert_eq!(d.remaining, 0);
        assert!(!d.allowed);
    }

    #[tokio::test]
    async fn test_snapshot_covers_all_features() {
        let (gate, clock) = gate(3);
        gate.consume("u1", FeatureType::StructuredAnalysis).await.unwrap();
        let snap = gate.snapshot("u1", clock.now()).await.unwrap();
        assert_eq!(snap.len(), 3);
        let sa = snap
            .iter()
            .find(|q| q.feature_type == FeatureType::StructuredAnalysis)
            .unwrap();
        assert_eq!(sa.decision.remaining, 1);
        assert_eq!(sa.reset_in, "14h 0m");
    }
}
