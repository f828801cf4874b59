//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! DeepSeek 提供与 OpenAI 完全兼容的 API 接口。
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use crate::llm::{LlmSettings, OpenAiClient};

/// DeepSeek API 常量
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 客户端：未指定 base_url 时使用官方地址，未指定模型时使用 deepseek-chat
pub fn create_deepseek_client(mut settings: LlmSettings) -> OpenAiClient {
    if settings.base_url.is_none() {
        settings.base_url = Some(DEEPSEEK_BASE_URL.to_string());
    }
    if settings.model.trim().is_empty() {
        settings.model = DEEPSEEK_CHAT.to_string();
    }
    OpenAiClient::new(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deepseek_defaults_applied() {
        let client = create_deepseek_client(LlmSettings {
            base_url: None,
            api_key: "sk-test".to_string(),
            model: String::new(),
            temperature: 0.2,
            max_tokens: 512,
        });
        assert_eq!(client.model(), DEEPSEEK_CHAT);
    }
}
