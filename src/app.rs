//! 网关组件装配：按配置一次性构建账本、闸门、生成引擎、历史与落地，注入 GatewayController
//!
//! HTTP 层与测试共用同一套装配逻辑。

use std::sync::Arc;

use anyhow::Context;

use crate::config::{AppConfig, LedgerBackend};
use crate::core::GatewayController;
use crate::llm::{create_llm_from_config, GenerationConfig, GenerationEngine, LlmClient};
use crate::memory::{ContentSink, FanoutSink, FileHistoryStore, JsonlAuditSink};
use crate::prompt::PromptAssembler;
use crate::quota::{
    Clock, FeatureGate, InMemoryUsageLedger, QuotaLimits, SqliteUsageLedger, SystemClock,
    UsageLedger, UsageWindow,
};
use crate::title::TitleSynthesizer;

/// 装配好的组件；controller 之外的句柄供管理接口使用
pub struct GatewayComponents {
    pub controller: Arc<GatewayController>,
    pub limits: Arc<QuotaLimits>,
    pub window: UsageWindow,
}

/// 使用配置中的 LLM 后端
pub fn create_gateway_components(cfg: &AppConfig) -> anyhow::Result<GatewayComponents> {
    create_gateway_components_with(cfg, create_llm_from_config(&cfg.llm), Arc::new(SystemClock))
}

/// 显式注入 LLM 客户端与时钟（测试用 MockLlmClient + ManualClock）
pub fn create_gateway_components_with(
    cfg: &AppConfig,
    llm: Arc<dyn LlmClient>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<GatewayComponents> {
    let window = UsageWindow::from_tz_name(&cfg.quota.timezone, Arc::clone(&clock))
        .with_context(|| format!("unknown quota timezone '{}'", cfg.quota.timezone))?;

    let ledger: Arc<dyn UsageLedger> = match cfg.quota.backend {
        LedgerBackend::Memory => Arc::new(InMemoryUsageLedger::new(window.clone())),
        LedgerBackend::Sqlite => Arc::new(
            SqliteUsageLedger::open(&cfg.quota.sqlite_path, window.clone()).with_context(|| {
                format!("failed to open usage ledger at {}", cfg.quota.sqlite_path.display())
            })?,
        ),
    };
    let limits = Arc::new(QuotaLimits::from_config(&cfg.quota.limits));
    let gate = Arc::new(FeatureGate::new(ledger, Arc::clone(&limits)));

    let engine = Arc::new(GenerationEngine::new(llm, GenerationConfig::from_config(&cfg.llm)));
    let titles = TitleSynthesizer::new(Arc::clone(&engine), cfg.title.keywords.clone());

    let history = Arc::new(FileHistoryStore::new(&cfg.storage.sessions_dir));
    let mut sink = FanoutSink::new().with(history.clone());
    if let Some(path) = cfg.storage.audit_log.as_ref() {
        sink = sink.with(Arc::new(JsonlAuditSink::new(path)));
    }
    let sink: Arc<dyn ContentSink> = Arc::new(sink);

    let controller = GatewayController::new(gate, engine)
        .with_assembler(PromptAssembler::from_config(&cfg.prompt))
        .with_titles(titles)
        .with_history(history)
        .with_sink(sink)
        .with_clock(clock);

    tracing::info!(
        backend = ?cfg.quota.backend,
        timezone = %window.timezone(),
        provider = %cfg.llm.provider,
        "gateway components ready"
    );

    Ok(GatewayComponents {
        controller: Arc::new(controller),
        limits,
        window,
    })
}
