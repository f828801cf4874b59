//! Mock LLM 客户端（用于测试与本地联调，无需 API）
//!
//! 固定回复按单词切块流式输出；可配置连接失败、流中断、卡死、块间延迟，
//! 并记录调用次数与上游流是否已释放，便于验证「拒绝时不调用」与「取消时放弃上游」。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError, LlmStream};
use crate::memory::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Reply,
    /// 连接阶段失败
    FailConnect,
    /// 输出 n 块后报错
    FailAfter(usize),
    /// 输出 n 块后不再有任何输出
    StallAfter(usize),
    /// 连接阶段就不返回
    Hang,
}

/// 流被丢弃或结束时置位
struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct MockStreamState {
    chunks: VecDeque<String>,
    mode: Mode,
    yielded: usize,
    delay: Option<Duration>,
    counter: Arc<AtomicUsize>,
    _guard: ReleaseGuard,
}

/// Mock 客户端
#[derive(Debug)]
pub struct MockLlmClient {
    reply: String,
    mode: Mode,
    chunk_delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    chunks_yielded: Arc<AtomicUsize>,
    stream_released: Arc<AtomicBool>,
    last_messages: Mutex<Vec<Message>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new("This is a mock answer. Please consult a licensed attorney for advice on your situation.")
    }
}

impl MockLlmClient {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            mode: Mode::Reply,
            chunk_delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
            chunks_yielded: Arc::new(AtomicUsize::new(0)),
            stream_released: Arc::new(AtomicBool::new(false)),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    /// 每次调用都在连接阶段失败
    pub fn failing() -> Self {
        Self {
            mode: Mode::FailConnect,
            ..Self::new("")
        }
    }

    /// 永不响应
    pub fn hanging() -> Self {
        Self {
            mode: Mode::Hang,
            ..Self::new("")
        }
    }

    pub fn failing_mid_stream(mut self, after_chunks: usize) -> Self {
        self.mode = Mode::FailAfter(after_chunks);
        self
    }

    pub fn stalling_after(mut self, after_chunks: usize) -> Self {
        self.mode = Mode::StallAfter(after_chunks);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// 按单词切块（保留分隔空格），拼接后与原文一致
    pub fn chunks_of(text: &str) -> Vec<String> {
        text.split_inclusive(' ').map(String::from).collect()
    }

    /// complete + complete_stream 的调用总次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn chunks_yielded(&self) -> usize {
        self.chunks_yielded.load(Ordering::SeqCst)
    }

    /// 最近一次 complete_stream 返回的流是否已结束或被丢弃
    pub fn stream_released(&self) -> bool {
        self.stream_released.load(Ordering::SeqCst)
    }

    /// 最近一次调用收到的消息
    pub fn last_messages(&self) -> Vec<Message> {
        self.last_messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    async fn enter(&self, messages: &[Message]) -> Result<(), LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_messages.lock() {
            *last = messages.to_vec();
        }
        match self.mode {
            Mode::FailConnect => Err(LlmError::ApiError("mock provider unavailable".to_string())),
            Mode::Hang => {
                futures_util::future::pending::<()>().await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.enter(messages).await?;
        if let Mode::FailAfter(_) = self.mode {
            return Err(LlmError::ApiError("mock connection reset".to_string()));
        }
        Ok(self.reply.clone())
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<LlmStream, LlmError> {
        self.enter(messages).await?;
        self.stream_released.store(false, Ordering::SeqCst);

        let state = MockStreamState {
            chunks: Self::chunks_of(&self.reply).into(),
            mode: self.mode,
            yielded: 0,
            delay: self.chunk_delay,
            counter: Arc::clone(&self.chunks_yielded),
            _guard: ReleaseGuard(Arc::clone(&self.stream_released)),
        };

        let s = stream::unfold(state, |mut st| async move {
            if let Some(d) = st.delay {
                tokio::time::sleep(d).await;
            }
            match st.mode {
                Mode::FailAfter(n) if st.yielded == n => {
                    st.chunks.clear();
                    st.mode = Mode::Reply;
                    return Some((Err(LlmError::StreamError("mock connection reset".to_string())), st));
                }
                Mode::StallAfter(n) if st.yielded == n => {
                    futures_util::future::pending::<()>().await;
                }
                _ => {}
            }
            let chunk = st.chunks.pop_front()?;
            st.yielded += 1;
            st.counter.fetch_add(1, Ordering::SeqCst);
            Some((Ok(chunk), st))
        });

        Ok(Box::pin(s))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_stream_concatenates_to_reply() {
        let mock = MockLlmClient::new("Tenancy law varies by state.");
        let full = mock.complete(&[Message::user("q")]).await.unwrap();
        let chunks: Vec<String> = mock
            .complete_stream(&[Message::user("q")])
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks.concat(), full);
        assert_eq!(mock.calls(), 2);
        assert!(mock.stream_released());
    }

    #[tokio::test]
    async fn test_fail_mid_stream() {
        let mock = MockLlmClient::new("one two three").failing_mid_stream(1);
        let items: Vec<Result<String, LlmError>> = mock
            .complete_stream(&[Message::user("q")])
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_failing_connect() {
        let mock = MockLlmClient::failing();
        assert!(mock.complete(&[Message::user("q")]).await.is_err());
        assert!(mock.complete_stream(&[Message::user("q")]).await.is_err());
    }
}
