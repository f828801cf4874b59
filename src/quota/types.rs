//! 配额数据模型：功能类型、用量记录、配额判定

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 配额窗口长度：24 小时
pub const WINDOW_HOURS: i64 = 24;

/// 受配额限制的功能（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureType {
    /// 快速问答
    QuickChat,
    /// 结构化法律分析
    StructuredAnalysis,
    /// 文书生成
    DocumentGeneration,
}

impl FeatureType {
    pub const ALL: [FeatureType; 3] = [
        FeatureType::QuickChat,
        FeatureType::StructuredAnalysis,
        FeatureType::DocumentGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::QuickChat => "quick_chat",
            FeatureType::StructuredAnalysis => "structured_analysis",
            FeatureType::DocumentGeneration => "document_generation",
        }
    }
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown feature type: {0}")]
pub struct UnknownFeature(pub String);

impl FromStr for FeatureType {
    type Err = UnknownFeature;

    /// 接受 quick_chat 与 QUICK_CHAT 两种写法
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick_chat" => Ok(FeatureType::QuickChat),
            "structured_analysis" => Ok(FeatureType::StructuredAnalysis),
            "document_generation" => Ok(FeatureType::DocumentGeneration),
            _ => Err(UnknownFeature(s.to_string())),
        }
    }
}

/// 某用户某功能在当前窗口内的用量
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub user_id: String,
    pub feature: FeatureType,
    /// 当前窗口起点（参考时区当日零点，以 UTC 存储）
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

impl UsageRecord {
    pub fn fresh(user_id: &str, feature: FeatureType, window_start: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            feature,
            window_start,
            count: 0,
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + Duration::hours(WINDOW_HOURS)
    }

    /// now >= window_start + 24h 即视为过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at()
    }
}

/// 配额判定结果（每次现算，不落库）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl QuotaDecision {
    /// 人类可读的重置倒计时，如 "3h 12m"
    pub fn reset_in(&self, now: DateTime<Utc>) -> String {
        format_countdown(self.reset_at - now)
    }
}

pub fn format_countdown(delta: Duration) -> String {
    let secs = delta.num_seconds().max(0);
    if secs < 60 {
        return "less than a minute".to_string();
    }
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}

/// 某功能的配额快照（rate-limit-status 接口使用）
#[derive(Debug, Clone, Serialize)]
pub struct FeatureQuota {
    pub feature_type: FeatureType,
    #[serde(flatten)]
    pub decision: QuotaDecision,
    pub reset_in: String,
}
