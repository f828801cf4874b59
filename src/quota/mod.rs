//! 配额层：用量账本（内存 / SQLite）、窗口与时钟、功能闸门

pub mod gate;
pub mod ledger;
pub mod sqlite;
pub mod types;
pub mod window;

pub use gate::{FeatureGate, QuotaLimits};
pub use ledger::{InMemoryUsageLedger, QuotaError, UsageLedger};
pub use sqlite::SqliteUsageLedger;
pub use types::{
    format_countdown, FeatureQuota, FeatureType, QuotaDecision, UnknownFeature, UsageRecord,
};
pub use window::{Clock, ManualClock, SystemClock, UsageWindow};
