//! 内容与用量审计落地（对核心而言是 fire-and-forget）
//!
//! 控制器通过 tokio::spawn 调用 ContentSink，失败只记日志，不影响请求结果。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::quota::FeatureType;

/// 一次配额消耗（无论放行或拒绝）
#[derive(Debug, Clone, Serialize)]
pub struct UsageEvent {
    pub request_id: String,
    pub user_id: String,
    pub feature_type: FeatureType,
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub at: DateTime<Utc>,
}

/// 一次完成的问答
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub request_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub feature_type: FeatureType,
    pub user_message: String,
    pub reply: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait ContentSink: Send + Sync {
    async fn record_usage(&self, event: UsageEvent);

    async fn record_exchange(&self, exchange: Exchange);
}

/// 什么也不做
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl ContentSink for NoopSink {
    async fn record_usage(&self, _event: UsageEvent) {}

    async fn record_exchange(&self, _exchange: Exchange) {}
}

/// 依次转发给多个 sink
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ContentSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ContentSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl ContentSink for FanoutSink {
    async fn record_usage(&self, event: UsageEvent) {
        for sink in &self.sinks {
            sink.record_usage(event.clone()).await;
        }
    }

    async fn record_exchange(&self, exchange: Exchange) {
        for sink in &self.sinks {
            sink.record_exchange(exchange.clone()).await;
        }
    }
}

/// 用量审计：每个事件追加一行 JSON
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn append_line<T: Serialize>(&self, record: &T) -> std::io::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        if let Some(p) = self.path.parent() {
            fs::create_dir_all(p).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AuditLine<'a> {
    Usage(&'a UsageEvent),
    Exchange {
        request_id: &'a str,
        user_id: &'a str,
        feature_type: FeatureType,
        reply_chars: usize,
        at: DateTime<Utc>,
    },
}

#[async_trait]
impl ContentSink for JsonlAuditSink {
    async fn record_usage(&self, event: UsageEvent) {
        if let Err(e) = self.append_line(&AuditLine::Usage(&event)).await {
            tracing::warn!("usage audit write failed: {}", e);
        }
    }

    /// 审计日志只记录回复长度，不写正文
    async fn record_exchange(&self, exchange: Exchange) {
        let line = AuditLine::Exchange {
            request_id: &exchange.request_id,
            user_id: &exchange.user_id,
            feature_type: exchange.feature_type,
            reply_chars: exchange.reply.chars().count(),
            at: exchange.at,
        };
        if let Err(e) = self.append_line(&line).await {
            tracing::warn!("exchange audit write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(allowed: bool) -> UsageEvent {
        UsageEvent {
            request_id: "r1".to_string(),
            user_id: "u1".to_string(),
            feature_type: FeatureType::QuickChat,
            allowed,
            remaining: 0,
            limit: 5,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_audit_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/usage.jsonl");
        let sink = JsonlAuditSink::new(&path);

        sink.record_usage(usage(true)).await;
        sink.record_usage(usage(false)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "usage");
        assert_eq!(lines[0]["allowed"], true);
        assert_eq!(lines[1]["allowed"], false);
        assert_eq!(lines[1]["feature_type"], "quick_chat");
    }
}
