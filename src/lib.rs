//! lexgate - 法律咨询对话网关
//!
//! 模块划分：
//! - **app**: 按配置装配网关组件
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 网关主控、请求状态机、错误映射、优雅关闭
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）与生成引擎
//! - **memory**: 对话轮次、历史读取与文件存储、内容与用量落地
//! - **prompt**: 人设 + 历史 + 新消息的 prompt 组装
//! - **quota**: 每日用量账本（内存 / SQLite）与功能闸门
//! - **title**: 会话标题生成与确定性回退
//! - **web**: axum HTTP / SSE 接口（feature = "web"）

pub mod app;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod prompt;
pub mod quota;
pub mod title;
#[cfg(feature = "web")]
pub mod web;

pub use crate::app::{create_gateway_components, GatewayComponents};
pub use crate::core::{GatewayController, GatewayError, GenerateOutcome, GenerateRequest, StreamOutcome};
