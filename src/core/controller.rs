//! 网关主控：校验 → 原子扣配额 → 读历史 → 组装 prompt → 生成 / 流式转发
//!
//! 配额在生成前原子扣除，拒绝时绝不调用上游；生成失败不退还配额。
//! 用量事件与完成的问答以 fire-and-forget 方式交给 ContentSink。

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;

use crate::config::PromptSection;
use crate::core::error::GatewayError;
use crate::core::state::{RequestPhase, RequestState};
use crate::llm::{ChunkStream, GenerationEngine};
use crate::memory::{
    validate_session_id, ContentSink, Exchange, HistoryReader, InMemoryHistory, NoopSink,
    UsageEvent,
};
use crate::prompt::PromptAssembler;
use crate::quota::{Clock, FeatureGate, FeatureQuota, FeatureType, QuotaDecision, SystemClock};
use crate::title::TitleSynthesizer;

/// 一次生成请求；历史由控制器按 session_id 读取
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub user_id: String,
    pub feature: FeatureType,
    pub session_id: Option<String>,
    pub message: String,
}

impl GenerateRequest {
    pub fn new(user_id: impl Into<String>, feature: FeatureType, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            feature,
            session_id: None,
            message: message.into(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug)]
pub enum GenerateOutcome {
    /// 配额用尽，未调用上游
    Denied(QuotaDecision),
    Completed { text: String, quota: QuotaDecision },
}

pub enum StreamOutcome {
    Denied(QuotaDecision),
    Streaming {
        quota: QuotaDecision,
        chunks: ReplyStream,
    },
}

pub struct GatewayController {
    gate: Arc<FeatureGate>,
    engine: Arc<GenerationEngine>,
    assembler: PromptAssembler,
    titles: TitleSynthesizer,
    history: Arc<dyn HistoryReader>,
    sink: Arc<dyn ContentSink>,
    clock: Arc<dyn Clock>,
}

impl GatewayController {
    /// 默认：内存历史、无落地、系统时钟、默认人设
    pub fn new(gate: Arc<FeatureGate>, engine: Arc<GenerationEngine>) -> Self {
        Self {
            titles: TitleSynthesizer::with_default_keywords(Arc::clone(&engine)),
            assembler: PromptAssembler::from_config(&PromptSection::default()),
            history: Arc::new(InMemoryHistory::new()),
            sink: Arc::new(NoopSink),
            clock: Arc::new(SystemClock),
            gate,
            engine,
        }
    }

    pub fn with_assembler(mut self, assembler: PromptAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn with_titles(mut self, titles: TitleSynthesizer) -> Self {
        self.titles = titles;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryReader>) -> Self {
        self.history = history;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ContentSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn gate(&self) -> &Arc<FeatureGate> {
        &self.gate
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 阻塞模式
    pub async fn generate(&self, req: GenerateRequest) -> Result<GenerateOutcome, GatewayError> {
        validate(&req)?;
        let mut state = RequestState::new();
        let quota = self.admit(&req, &mut state).await?;
        if !quota.allowed {
            state.transition(RequestPhase::Denied);
            return Ok(GenerateOutcome::Denied(quota));
        }

        let prompt = match self.build_prompt(&req).await {
            Ok(p) => p,
            Err(e) => {
                state.transition(RequestPhase::Failed);
                return Err(e);
            }
        };
        state.transition(RequestPhase::PromptBuilt);
        state.transition(RequestPhase::Generating);

        match self.engine.generate(&prompt).await {
            Ok(text) => {
                state.transition(RequestPhase::Completed);
                spawn_exchange(&self.sink, pending_exchange(&state, &req, self.now()), text.clone());
                Ok(GenerateOutcome::Completed { text, quota })
            }
            Err(e) => {
                state.transition(RequestPhase::Failed);
                tracing::warn!(request_id = %state.id(), user_id = %req.user_id, "generation failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// 流式模式：放行后立即返回，文本块由 ReplyStream 逐个产出
    pub async fn generate_stream(&self, req: GenerateRequest) -> Result<StreamOutcome, GatewayError> {
        validate(&req)?;
        let mut state = RequestState::new();
        let quota = self.admit(&req, &mut state).await?;
        if !quota.allowed {
            state.transition(RequestPhase::Denied);
            return Ok(StreamOutcome::Denied(quota));
        }

        let prompt = match self.build_prompt(&req).await {
            Ok(p) => p,
            Err(e) => {
                state.transition(RequestPhase::Failed);
                return Err(e);
            }
        };
        state.transition(RequestPhase::PromptBuilt);
        state.transition(RequestPhase::Generating);

        let pending = pending_exchange(&state, &req, self.now());
        let chunks = ReplyStream {
            inner: self.engine.generate_stream(&prompt),
            text: String::new(),
            state,
            pending: Some(pending),
            sink: Arc::clone(&self.sink),
        };
        Ok(StreamOutcome::Streaming { quota, chunks })
    }

    /// 会话标题；只校验非空，生成失败时走确定性回退
    pub async fn title(&self, first_message: &str) -> Result<String, GatewayError> {
        if first_message.trim().is_empty() {
            return Err(GatewayError::Validation("first_message must not be empty".to_string()));
        }
        Ok(self.titles.synthesize(first_message).await)
    }

    pub async fn quota_status(&self, user_id: &str) -> Result<Vec<FeatureQuota>, GatewayError> {
        if user_id.trim().is_empty() {
            return Err(GatewayError::Validation("user_id must not be empty".to_string()));
        }
        Ok(self.gate.snapshot(user_id, self.now()).await?)
    }

    async fn admit(
        &self,
        req: &GenerateRequest,
        state: &mut RequestState,
    ) -> Result<QuotaDecision, GatewayError> {
        let decision = self.gate.consume(&req.user_id, req.feature).await.map_err(|e| {
            tracing::error!(request_id = %state.id(), "usage ledger failure: {}", e);
            GatewayError::from(e)
        })?;
        state.transition(RequestPhase::QuotaChecked);

        if !decision.allowed {
            tracing::info!(
                request_id = %state.id(),
                user_id = %req.user_id,
                feature = %req.feature,
                "quota exhausted"
            );
        }

        let event = UsageEvent {
            request_id: state.id().to_string(),
            user_id: req.user_id.clone(),
            feature_type: req.feature,
            allowed: decision.allowed,
            remaining: decision.remaining,
            limit: decision.limit,
            at: self.now(),
        };
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            sink.record_usage(event).await;
        });
        Ok(decision)
    }

    async fn build_prompt(&self, req: &GenerateRequest) -> Result<String, GatewayError> {
        let history = match req.session_id.as_deref() {
            Some(id) => self.history.load_history(id).await.map_err(|e| {
                tracing::error!(session_id = id, "failed to load history: {}", e);
                GatewayError::from(e)
            })?,
            None => Vec::new(),
        };
        Ok(self.assembler.assemble(&history, &req.message))
    }
}

fn validate(req: &GenerateRequest) -> Result<(), GatewayError> {
    if req.user_id.trim().is_empty() {
        return Err(GatewayError::Validation("user_id must not be empty".to_string()));
    }
    if req.message.trim().is_empty() {
        return Err(GatewayError::Validation("message must not be empty".to_string()));
    }
    if let Some(id) = req.session_id.as_deref() {
        validate_session_id(id)?;
    }
    Ok(())
}

fn pending_exchange(state: &RequestState, req: &GenerateRequest, at: DateTime<Utc>) -> Exchange {
    Exchange {
        request_id: state.id().to_string(),
        user_id: req.user_id.clone(),
        session_id: req.session_id.clone(),
        feature_type: req.feature,
        user_message: req.message.clone(),
        reply: String::new(),
        at,
    }
}

fn spawn_exchange(sink: &Arc<dyn ContentSink>, mut exchange: Exchange, reply: String) {
    exchange.reply = reply;
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        sink.record_exchange(exchange).await;
    });
}

/// 流式回复：原样按序转发文本块；正常结束时落地问答，被丢弃时取消上游
pub struct ReplyStream {
    inner: ChunkStream,
    text: String,
    state: RequestState,
    /// 出错后置空，不再落地
    pending: Option<Exchange>,
    sink: Arc<dyn ContentSink>,
}

impl ReplyStream {
    pub fn request_id(&self) -> uuid::Uuid {
        self.state.id()
    }

    pub fn phase(&self) -> RequestPhase {
        self.state.phase()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl Stream for ReplyStream {
    type Item = Result<String, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.text.push_str(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.pending = None;
                this.state.transition(RequestPhase::Failed);
                tracing::warn!(
                    request_id = %this.state.id(),
                    delivered_chars = this.text.chars().count(),
                    "stream generation failed: {}",
                    e
                );
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                if let Some(exchange) = this.pending.take() {
                    this.state.transition(RequestPhase::Completed);
                    spawn_exchange(&this.sink, exchange, std::mem::take(&mut this.text));
                }
                Poll::Ready(None)
            }
        }
    }
}
