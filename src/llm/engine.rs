//! 生成引擎：阻塞整段与增量流式两种模式
//!
//! 流式模式下由后台任务从上游读取文本块，推入有界通道；消费端 ChunkStream 被丢弃或 cancel() 时
//! 取消令牌触发，后台任务立即丢弃上游流（释放连接），不会跑完再丢弃结果。
//! 不做自动重试：失败即上抛。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::LlmSection;
use crate::llm::LlmClient;
use crate::memory::Message;

/// 生成失败
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("upstream generation failed: {0}")]
    Upstream(String),

    #[error("upstream generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider returned an empty response")]
    EmptyResponse,
}

impl GenerationError {
    /// 超时也归为上游失败
    pub fn is_upstream(&self) -> bool {
        matches!(self, GenerationError::Upstream(_) | GenerationError::Timeout(_))
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// 阻塞调用整体超时；流式模式下为建立连接 + 首块的超时
    pub request_timeout: Duration,
    /// 流式模式下两块之间的最长静默
    pub stream_idle_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            stream_idle_timeout: Duration::from_secs(30),
            channel_capacity: 32,
        }
    }
}

impl GenerationConfig {
    pub fn from_config(section: &LlmSection) -> Self {
        Self {
            request_timeout: Duration::from_secs(section.timeouts.request),
            stream_idle_timeout: Duration::from_secs(section.timeouts.stream_idle),
            channel_capacity: section.channel_capacity.max(1),
        }
    }
}

pub struct GenerationEngine {
    llm: Arc<dyn LlmClient>,
    config: GenerationConfig,
}

impl GenerationEngine {
    pub fn new(llm: Arc<dyn LlmClient>, config: GenerationConfig) -> Self {
        Self { llm, config }
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    fn messages(prompt: &str) -> Vec<Message> {
        vec![Message::user(prompt)]
    }

    /// 阻塞模式：等待完整回复
    pub async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let messages = Self::messages(prompt);
        let text = match tokio::time::timeout(self.config.request_timeout, self.llm.complete(&messages)).await {
            Err(_) => {
                tracing::warn!(timeout = ?self.config.request_timeout, "upstream generation timed out");
                return Err(GenerationError::Timeout(self.config.request_timeout));
            }
            Ok(Err(e)) => {
                tracing::warn!("upstream generation failed: {}", e);
                return Err(GenerationError::Upstream(e.to_string()));
            }
            Ok(Ok(text)) => text,
        };
        if text.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(text)
    }

    /// 流式模式：立即返回 ChunkStream，连接与读取在后台任务中进行
    pub fn generate_stream(&self, prompt: &str) -> ChunkStream {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let token = CancellationToken::new();

        tokio::spawn(produce(
            Arc::clone(&self.llm),
            Self::messages(prompt),
            self.config.clone(),
            tx,
            token.clone(),
        ));

        ChunkStream { rx, token }
    }
}

async fn produce(
    llm: Arc<dyn LlmClient>,
    messages: Vec<Message>,
    config: GenerationConfig,
    tx: mpsc::Sender<Result<String, GenerationError>>,
    token: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        _ = token.cancelled() => {
            tracing::debug!("stream cancelled before upstream connected");
            return;
        }
        r = tokio::time::timeout(config.request_timeout, llm.complete_stream(&messages)) => r,
    };
    let mut upstream = match opened {
        Err(_) => {
            tracing::warn!("upstream stream did not open within {:?}", config.request_timeout);
            let _ = tx.send(Err(GenerationError::Timeout(config.request_timeout))).await;
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!("upstream stream failed to open: {}", e);
            let _ = tx.send(Err(GenerationError::Upstream(e.to_string()))).await;
            return;
        }
        Ok(Ok(s)) => s,
    };

    let mut delivered = 0usize;
    let mut saw_text = false;
    loop {
        let wait = if delivered == 0 {
            config.request_timeout
        } else {
            config.stream_idle_timeout
        };
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(delivered, "stream cancelled by consumer, dropping upstream");
                return;
            }
            n = tokio::time::timeout(wait, upstream.next()) => n,
        };
        match next {
            Err(_) => {
                tracing::warn!(delivered, "upstream stream idle for {:?}", wait);
                let _ = tx.send(Err(GenerationError::Timeout(wait))).await;
                return;
            }
            Ok(None) => {
                if !saw_text {
                    let _ = tx.send(Err(GenerationError::EmptyResponse)).await;
                }
                tracing::debug!(delivered, "upstream stream completed");
                return;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(delivered, "upstream stream broke: {}", e);
                let _ = tx.send(Err(GenerationError::Upstream(e.to_string()))).await;
                return;
            }
            Ok(Some(Ok(chunk))) => {
                if chunk.is_empty() {
                    continue;
                }
                saw_text |= !chunk.trim().is_empty();
                // 有界通道：消费端慢时在此背压；消费端断开则放弃上游
                let sent = tokio::select! {
                    biased;
                    _ = token.cancelled() => false,
                    r = tx.send(Ok(chunk)) => r.is_ok(),
                };
                if !sent {
                    tracing::debug!(delivered, "consumer gone, dropping upstream");
                    return;
                }
                delivered += 1;
            }
        }
    }
}

/// 流式回复的消费端：按到达顺序产出非空文本块；出错时产出一个 Err 后结束
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<String, GenerationError>>,
    token: CancellationToken,
}

impl ChunkStream {
    /// 主动取消：后台任务放弃上游调用
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 读完整个流并拼接；遇到错误即返回
    pub async fn collect_text(mut self) -> Result<String, GenerationError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            text.push_str(&item?);
        }
        Ok(text)
    }
}

impl Stream for ChunkStream {
    type Item = Result<String, GenerationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn engine(mock: Arc<MockLlmClient>, cfg: GenerationConfig) -> GenerationEngine {
        GenerationEngine::new(mock, cfg)
    }

    fn fast_config() -> GenerationConfig {
        GenerationConfig {
            request_timeout: Duration::from_millis(200),
            stream_idle_timeout: Duration::from_millis(200),
            channel_capacity: 2,
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_generate_returns_text() {
        let mock = Arc::new(MockLlmClient::new("A lease is a contract."));
        let text = engine(mock, GenerationConfig::default())
            .generate("prompt")
            .await
            .unwrap();
        assert_eq!(text, "A lease is a contract.");
    }

    #[tokio::test]
    async fn test_generate_empty_response() {
        let mock = Arc::new(MockLlmClient::new("   "));
        let err = engine(mock, GenerationConfig::default())
            .generate("prompt")
            .await
            .unwrap_err();
        assert_eq!(err, GenerationError::EmptyResponse);
    }

    #[tokio::test]
    async fn test_generate_upstream_failure() {
        let mock = Arc::new(MockLlmClient::failing());
        let err = engine(mock, GenerationConfig::default())
            .generate("prompt")
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_generate_timeout() {
        let mock = Arc::new(MockLlmClient::hanging());
        let err = engine(mock, fast_config()).generate("prompt").await.unwrap_err();
        assert!(matches!(err, GenerationError::Timeout(_)));
        assert!(err.is_upstream());
    }

    #[tokio::test]
    async fn test_stream_order_matches_blocking() {
        let reply = "Under most statutes the deposit must be returned within thirty days.";
        let mock = Arc::new(MockLlmClient::new(reply));
        let engine = engine(mock, fast_config());

        let chunks: Vec<String> = engine
            .generate_stream("prompt")
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, MockLlmClient::chunks_of(reply));
        assert_eq!(chunks.concat(), engine.generate("prompt").await.unwrap());
    }

    #[tokio::test]
    async fn test_stream_connect_failure_is_first_item() {
        let mock = Arc::new(MockLlmClient::failing());
        let items: Vec<_> = engine(mock, fast_config())
            .generate_stream("prompt")
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(GenerationError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_stream_mid_failure_after_partial() {
        let mock = Arc::new(MockLlmClient::new("one two three four").failing_mid_stream(2));
        let items: Vec<_> = engine(mock, fast_config())
            .generate_stream("prompt")
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[0], Ok("one ".to_string()));
        assert_eq!(items[1], Ok("two ".to_string()));
        assert!(matches!(items[2], Err(GenerationError::Upstream(_))));
    }

    #[tokio::test]
    async fn test_stream_idle_timeout() {
        let mock = Arc::new(MockLlmClient::new("one two three").stalling_after(1));
        let items: Vec<_> = engine(mock, fast_config())
            .generate_stream("prompt")
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(GenerationError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_stream_empty_response() {
        let mock = Arc::new(MockLlmClient::new(""));
        let result = engine(mock, fast_config())
            .generate_stream("prompt")
            .collect_text()
            .await;
        assert_eq!(result, Err(GenerationError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_drop_cancels_upstream() {
        let mock = Arc::new(MockLlmClient::new("one two three four").stalling_after(1));
        let engine = engine(Arc::clone(&mock), GenerationConfig::default());

        let mut stream = engine.generate_stream("prompt");
        assert_eq!(stream.next().await, Some(Ok("one ".to_string())));
        assert!(!mock.stream_released());

        drop(stream);
        assert!(wait_until(|| mock.stream_released()).await);
        assert_eq!(mock.chunks_yielded(), 1);
    }

    #[tokio::test]
    async fn test_explicit_cancel_ends_stream() {
        let mock = Arc::new(
            MockLlmClient::new("a b c d e f g h").with_chunk_delay(Duration::from_millis(20)),
        );
        let engine = engine(Arc::clone(&mock), GenerationConfig::default());

        let mut stream = engine.generate_stream("prompt");
        assert!(stream.next().await.is_some());
        stream.cancel();
        assert!(stream.is_cancelled());
        assert!(wait_until(|| mock.stream_released()).await);
        assert!(mock.chunks_yielded() < 8);
    }
}
