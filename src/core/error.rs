//! 网关错误类型与对外错误码
//!
//! 各层错误（GenerationError / QuotaError / HistoryError）经 From 转换为 GatewayError；
//! 对外只暴露 code() 与 public_message()，上游原始错误文本只进日志。
//! 配额用尽不是错误，见 controller 中的 Denied 分支。

use thiserror::Error;

use crate::llm::GenerationError;
use crate::memory::HistoryError;
use crate::quota::QuotaError;

/// 配额用尽时对外使用的错误码（对应 Denied 结果，而非 GatewayError）
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    Validation(String),

    /// 上游失败或超时；内容只用于日志
    #[error("Upstream generation failed: {0}")]
    Upstream(String),

    #[error("Provider returned an empty response")]
    EmptyResponse,

    /// 用量账本故障
    #[error("Usage storage error: {0}")]
    Storage(String),

    #[error("History error: {0}")]
    History(String),
}

impl GatewayError {
    /// 机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::Upstream(_) => "UPSTREAM_GENERATION_ERROR",
            GatewayError::EmptyResponse => "EMPTY_RESPONSE",
            GatewayError::Storage(_) | GatewayError::History(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP 状态码
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::Upstream(_) | GatewayError::EmptyResponse => 502,
            GatewayError::Storage(_) | GatewayError::History(_) => 500,
        }
    }

    /// 可以安全返回给调用方的文案
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Validation(msg) => msg.clone(),
            GatewayError::Upstream(_) => "Generation failed. Please try again later.".to_string(),
            GatewayError::EmptyResponse => {
                "The assistant returned an empty response. Please try again.".to_string()
            }
            GatewayError::Storage(_) | GatewayError::History(_) => {
                "Internal error. Please try again later.".to_string()
            }
        }
    }
}

impl From<GenerationError> for GatewayError {
    fn from(e: GenerationError) -> Self {
        match e {
            GenerationError::Upstream(msg) => GatewayError::Upstream(msg),
            GenerationError::Timeout(d) => GatewayError::Upstream(format!("timed out after {:?}", d)),
            GenerationError::EmptyResponse => GatewayError::EmptyResponse,
        }
    }
}

impl From<QuotaError> for GatewayError {
    fn from(e: QuotaError) -> Self {
        GatewayError::Storage(e.to_string())
    }
}

impl From<HistoryError> for GatewayError {
    fn from(e: HistoryError) -> Self {
        match e {
            HistoryError::InvalidSession(id) => {
                GatewayError::Validation(format!("invalid session_id: {}", id))
            }
            other => GatewayError::History(other.to_string()),
        }
    }
}
