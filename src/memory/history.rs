//! 会话历史读取接口
//!
//! 历史由外部存储持有；核心只通过 HistoryReader 按 session_id 读取。

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::ConversationTurn;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("invalid session id: {0}")]
    InvalidSession(String),

    #[error("history io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait HistoryReader: Send + Sync {
    /// 按时间顺序（旧 → 新）返回会话历史；未知会话返回空
    async fn load_history(&self, session_id: &str) -> Result<Vec<ConversationTurn>, HistoryError>;
}

/// 内存历史（测试与无持久化部署使用）
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    sessions: RwLock<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, session_id: &str, turn: ConversationTurn) {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(turn);
    }
}

#[async_trait]
impl HistoryReader for InMemoryHistory {
    async fn load_history(&self, session_id: &str) -> Result<Vec<ConversationTurn>, HistoryError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// 会话 ID 只允许字母、数字、- 与 _（用作文件名）
pub fn validate_session_id(session_id: &str) -> Result<(), HistoryError> {
    let ok = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(HistoryError::InvalidSession(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_history_order() {
        let history = InMemoryHistory::new();
        history.push("s1", ConversationTurn::user("first")).await;
        history.push("s1", ConversationTurn::assistant("second")).await;

        let turns = history.load_history("s1").await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "first");
        assert!(history.load_history("other").await.unwrap().is_empty());
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("abc-123_X").is_ok());
        assert!(validate_session_id("../etc/passwd").is_err());
        assert!(validate_session_id("").is_err());
    }
}
