//! 单次请求的状态机
//!
//! Received → QuotaChecked → (Denied | PromptBuilt → Generating → Completed | Failed)
//! 非法迁移被拒绝；每次迁移都以 debug 级别记录。

use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    Received,
    QuotaChecked,
    Denied,
    PromptBuilt,
    Generating,
    Completed,
    Failed,
}

impl RequestPhase {
    /// 是否允许从 self 迁移到 next
    pub fn can_advance_to(self, next: RequestPhase) -> bool {
        use RequestPhase::*;
        matches!(
            (self, next),
            (Received, QuotaChecked)
                | (QuotaChecked, Denied)
                | (QuotaChecked, PromptBuilt)
                | (QuotaChecked, Failed)
                | (PromptBuilt, Generating)
                | (Generating, Completed)
                | (Generating, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestPhase::Denied | RequestPhase::Completed | RequestPhase::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("illegal request transition {from:?} -> {to:?}")]
pub struct IllegalTransition {
    pub from: RequestPhase,
    pub to: RequestPhase,
}

/// 请求 ID + 当前阶段
#[derive(Debug, Clone)]
pub struct RequestState {
    id: Uuid,
    phase: RequestPhase,
}

impl Default for RequestState {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: RequestPhase::Received,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn advance(&mut self, next: RequestPhase) -> Result<(), IllegalTransition> {
        if !self.phase.can_advance_to(next) {
            tracing::warn!(request_id = %self.id, from = ?self.phase, to = ?next, "illegal request transition");
            return Err(IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(request_id = %self.id, from = ?self.phase, to = ?next, "request phase");
        self.phase = next;
        Ok(())
    }

    /// 不关心结果的迁移：非法迁移已在 advance 中记录 warn，阶段保持不变
    pub fn transition(&mut self, next: RequestPhase) {
        if self.advance(next).is_err() {
            debug_assert!(self.phase.is_terminal(), "illegal transition from live phase {:?}", self.phase);
        }
    }
}
