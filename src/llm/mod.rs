//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）以及生成引擎

pub mod deepseek;
pub mod engine;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use engine::{ChunkStream, GenerationConfig, GenerationEngine, GenerationError};
pub use mock::MockLlmClient;
pub use openai::{LlmSettings, OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, LlmStream};

use crate::config::LlmSection;

impl LlmSettings {
    pub fn from_config(section: &LlmSection) -> Self {
        Self {
            base_url: section.base_url.clone(),
            api_key: section
                .api_key
                .clone()
                .unwrap_or_else(|| "sk-placeholder".to_string()),
            model: section.model.clone(),
            temperature: section.temperature,
            max_tokens: section.max_tokens,
        }
    }
}

/// 按 [llm].provider 创建客户端：deepseek / openai / mock；未知取值回退到 OpenAI 兼容
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    let settings = LlmSettings::from_config(section);
    match section.provider.to_ascii_lowercase().as_str() {
        "mock" => Arc::new(MockLlmClient::default()),
        "deepseek" => Arc::new(create_deepseek_client(settings)),
        "openai" => Arc::new(OpenAiClient::new(settings)),
        other => {
            tracing::warn!("unknown llm provider '{}', using OpenAI-compatible client", other);
            Arc::new(OpenAiClient::new(settings))
        }
    }
}
