//! 记忆层：对话轮次、历史读取、文件存储、内容与用量落地

pub mod conversation;
pub mod history;
pub mod persistence;
pub mod sink;

pub use conversation::{ConversationTurn, Message, Role, TurnRole};
pub use history::{validate_session_id, HistoryError, HistoryReader, InMemoryHistory};
pub use persistence::FileHistoryStore;
pub use sink::{ContentSink, Exchange, FanoutSink, JsonlAuditSink, NoopSink, UsageEvent};
