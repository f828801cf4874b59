//! 会话历史文件存储
//!
//! 每个会话一个 JSON 文件（sessions_dir/<session_id>.json），内容为按时间排列的轮次。
//! 既是 HistoryReader，也是 ContentSink：问答完成后追加 user + assistant 两轮。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;

use super::history::{validate_session_id, HistoryError, HistoryReader};
use super::sink::{ContentSink, Exchange, UsageEvent};
use super::ConversationTurn;

#[derive(Debug)]
pub struct FileHistoryStore {
    dir: PathBuf,
    /// 串行化写入，避免同一会话的并发读改写互相覆盖
    write_lock: Mutex<()>,
}

impl FileHistoryStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf, HistoryError> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.json", session_id)))
    }

    async fn read_turns(path: &Path) -> Result<Vec<ConversationTurn>, HistoryError> {
        match fs::read_to_string(path).await {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// 追加若干轮到会话末尾；父目录不存在时自动创建
    pub async fn append(
        &self,
        session_id: &str,
        turns: &[ConversationTurn],
    ) -> Result<(), HistoryError> {
        let path = self.session_path(session_id)?;
        let _guard = self.write_lock.lock().await;
        let mut all = Self::read_turns(&path).await?;
        all.extend_from_slice(turns);
        fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&all)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryReader for FileHistoryStore {
    async fn load_history(&self, session_id: &str) -> Result<Vec<ConversationTurn>, HistoryError> {
        let path = self.session_path(session_id)?;
        Self::read_turns(&path).await
    }
}

#[async_trait]
impl ContentSink for FileHistoryStore {
    async fn record_usage(&self, _event: UsageEvent) {}

    async fn record_exchange(&self, exchange: Exchange) {
        let Some(session_id) = exchange.session_id.as_deref() else {
            return;
        };
        let turns = [
            ConversationTurn::user(exchange.user_message.clone()),
            ConversationTurn::assistant(exchange.reply.clone()),
        ];
        if let Err(e) = self.append(session_id, &turns).await {
            tracing::warn!(session_id, "failed to persist exchange: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::quota::FeatureType;

    #[tokio::test]
    async fn test_missing_session_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path());
        assert!(store.load_history("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exchange_appends_two_turns() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("sessions"));
        store
            .append("s1", &[ConversationTurn::user("hello")])
            .await
            .unwrap();

        store
            .record_exchange(Exchange {
                request_id: "r1".to_string(),
                user_id: "u1".to_string(),
                session_id: Some("s1".to_string()),
                feature_type: FeatureType::QuickChat,
                user_message: "Can my employer fire me?".to_string(),
                reply: "It depends on your contract.".to_string(),
                at: Utc::now(),
            })
            .await;

        let turns = store.load_history("s1").await.unwrap();
        assert_eq!(
            turns,
            vec![
                ConversationTurn::user("hello"),
                ConversationTurn::user("Can my employer fire me?"),
                ConversationTurn::assistant("It depends on your contract."),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path());
        let err = store.load_history("../secret").await.unwrap_err();
        assert!(matches!(err, HistoryError::InvalidSession(_)));
    }
}
