//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LEXGATE__*` 覆盖（双下划线表示嵌套，如 `LEXGATE__QUOTA__LIMITS__QUICK_CHAT=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::quota::FeatureType;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub llm: LlmSection,
    pub quota: QuotaSection,
    pub prompt: PromptSection,
    pub title: TitleSection,
    pub storage: StorageSection,
}

/// [server] 段：监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// [llm] 段：后端选择、模型参数与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 流式通道容量（生成端与控制器之间的有界缓冲）
    pub channel_capacity: usize,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            api_key: None,
            temperature: 0.3,
            max_tokens: 2048,
            channel_capacity: 32,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

/// [llm.timeouts] 段（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 阻塞调用整体超时 / 流式首包超时
    pub request: u64,
    /// 流式两块之间的最长静默
    pub stream_idle: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            stream_idle: 30,
        }
    }
}

/// 配额账本后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [quota] 段：时区、账本后端、各功能每日上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaSection {
    /// 每日窗口的参考时区（IANA 名称，如 UTC、Asia/Shanghai）
    pub timezone: String,
    pub backend: LedgerBackend,
    pub sqlite_path: PathBuf,
    pub limits: QuotaLimitsSection,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            backend: LedgerBackend::Memory,
            sqlite_path: PathBuf::from("data/usage.db"),
            limits: QuotaLimitsSection::default(),
        }
    }
}

/// [quota.limits] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaLimitsSection {
    pub quick_chat: u32,
    pub structured_analysis: u32,
    pub document_generation: u32,
}

impl Default for QuotaLimitsSection {
    fn default() -> Self {
        Self {
            quick_chat: 20,
            structured_analysis: 5,
            document_generation: 3,
        }
    }
}

impl QuotaLimitsSection {
    pub fn limit_for(&self, feature: FeatureType) -> u32 {
        match feature {
            FeatureType::QuickChat => self.quick_chat,
            FeatureType::StructuredAnalysis => self.structured_analysis,
            FeatureType::DocumentGeneration => self.document_generation,
        }
    }
}

/// [prompt] 段：人设与历史长度上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptSection {
    pub persona: String,
    /// 保留最近多少条历史（None 表示不限）
    pub max_history_turns: Option<usize>,
    /// 历史渲染后的字符预算（None 表示不限）
    pub max_history_chars: Option<usize>,
}

impl Default for PromptSection {
    fn default() -> Self {
        Self {
            persona: default_persona(),
            max_history_turns: Some(20),
            max_history_chars: Some(12_000),
        }
    }
}

fn default_persona() -> String {
    "You are a careful legal assistant. Explain the relevant legal concepts in plain language, \
     point out when the answer depends on jurisdiction, and recommend consulting a licensed \
     attorney for decisions with legal consequences."
        .to_string()
}

/// [title] 段：回退标题使用的关键词（按优先级）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TitleSection {
    pub keywords: Vec<String>,
}

impl Default for TitleSection {
    fn default() -> Self {
        Self {
            keywords: crate::title::DEFAULT_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

/// [storage] 段：会话历史目录与用量审计日志
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub sessions_dir: PathBuf,
    pub audit_log: Option<PathBuf>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("data/sessions"),
            audit_log: Some(PathBuf::from("data/usage-audit.jsonl")),
        }
    }
}

/// 从 config 目录加载配置，环境变量 LEXGATE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 LEXGATE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LEXGATE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（供 /api/config/reload 热更新配额上限）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.quota.timezone, "UTC");
        assert_eq!(cfg.quota.backend, LedgerBackend::Memory);
        assert_eq!(cfg.quota.limits.limit_for(FeatureType::QuickChat), 20);
        assert_eq!(cfg.llm.timeouts.request, 60);
        assert!(!cfg.title.keywords.is_empty());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[quota]\nbackend = \"sqlite\"\n[quota.limits]\nquick_chat = 5\n[llm]\nprovider = \"mock\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.quota.backend, LedgerBackend::Sqlite);
        assert_eq!(cfg.quota.limits.quick_chat, 5);
        // 未覆盖的键保留默认值
        assert_eq!(cfg.quota.limits.structured_analysis, 5);
        assert_eq!(cfg.llm.provider, "mock");
    }
}
