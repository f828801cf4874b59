//! 核心编排层：网关主控、请求状态机、错误映射、优雅关闭

pub mod controller;
pub mod error;
pub mod shutdown;
pub mod state;

pub use controller::{
    GatewayController, GenerateOutcome, GenerateRequest, ReplyStream, StreamOutcome,
};
pub use error::{GatewayError, RATE_LIMIT_EXCEEDED};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{IllegalTransition, RequestPhase, RequestState};
