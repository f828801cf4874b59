//! Prompt 组装：人设 + 历史对话 + 新消息 → 单个 prompt 字符串
//!
//! 纯函数，无全局状态。历史超出上限时按 FIFO 丢弃最旧的轮次；最新一轮历史与新消息永不丢弃。

use crate::config::PromptSection;
use crate::memory::ConversationTurn;

/// 历史长度上限；两项都为 None 时不截断
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryLimit {
    /// 最多保留最近多少轮
    pub max_turns: Option<usize>,
    /// 渲染后历史的字符预算（按 char 计）
    pub max_chars: Option<usize>,
}

impl HistoryLimit {
    pub fn unbounded() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    persona: String,
    limit: HistoryLimit,
}

impl PromptAssembler {
    pub fn new(persona: impl Into<String>, limit: HistoryLimit) -> Self {
        Self {
            persona: persona.into(),
            limit,
        }
    }

    pub fn from_config(section: &PromptSection) -> Self {
        Self::new(
            section.persona.clone(),
            HistoryLimit {
                max_turns: section.max_history_turns,
                max_chars: section.max_history_chars,
            },
        )
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn assemble(&self, history: &[ConversationTurn], message: &str) -> String {
        assemble_prompt(&self.persona, history, message, self.limit)
    }
}

/// 在上限内保留的历史后缀（最近的若干轮）
pub fn retained_history(history: &[ConversationTurn], limit: HistoryLimit) -> &[ConversationTurn] {
    let mut start = match limit.max_turns {
        Some(n) => history.len().saturating_sub(n),
        None => 0,
    };
    if let Some(budget) = limit.max_chars {
        let kept = &history[start..];
        let mut used = 0usize;
        let mut keep = 0usize;
        for turn in kept.iter().rev() {
            // 每行外加一个换行
            let cost = turn.role.label().len() + 2 + turn.content.chars().count() + 1;
            if keep > 0 && used + cost > budget {
                break;
            }
            used += cost;
            keep += 1;
        }
        start += kept.len() - keep;
    }
    &history[start..]
}

pub fn assemble_prompt(
    persona: &str,
    history: &[ConversationTurn],
    message: &str,
    limit: HistoryLimit,
) -> String {
    let mut sections: Vec<String> = Vec::with_capacity(3);
    let persona = persona.trim();
    if !persona.is_empty() {
        sections.push(persona.to_string());
    }

    let kept = retained_history(history, limit);
    if !kept.is_empty() {
        sections.push(
            kept.iter()
                .map(ConversationTurn::render)
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    sections.push(format!("User: {}\nAssistant:", message));
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::user("Is a verbal contract binding?"),
            ConversationTurn::assistant("Often yes, with exceptions."),
            ConversationTurn::user("What exceptions?"),
            ConversationTurn::assistant("Real estate sales, for example."),
        ]
    }

    #[test]
    fn test_layout_without_history() {
        let p = assemble_prompt("You are a legal assistant.", &[], "Hi", HistoryLimit::unbounded());
        assert_eq!(p, "You are a legal assistant.\n\nUser: Hi\nAssistant:");
    }

    #[test]
    fn test_layout_with_history() {
        let p = assemble_prompt("Persona", &history()[..2], "Next?", HistoryLimit::unbounded());
        assert_eq!(
            p,
            "Persona\n\nUser: Is a verbal contract binding?\nAssistant: Often yes, with exceptions.\n\nUser: Next?\nAssistant:"
        );
        assert!(p.ends_with("Assistant:"));
    }

    #[test]
    fn test_deterministic() {
        let a = PromptAssembler::new("Persona", HistoryLimit::unbounded());
        assert_eq!(a.assemble(&history(), "Q"), a.assemble(&history(), "Q"));
    }

    #[test]
    fn test_max_turns_drops_oldest() {
        let limit = HistoryLimit {
            max_turns: Some(2),
            max_chars: None,
        };
        let h = history();
        let kept = retained_history(&h, limit);
        assert_eq!(kept, &history()[2..]);

        let p = assemble_prompt("P", &history(), "Q", limit);
        assert!(!p.contains("verbal contract"));
        assert!(p.contains("Real estate sales"));
        assert!(p.ends_with("User: Q\nAssistant:"));
    }

    #[test]
    fn test_char_budget_keeps_newest() {
        // "Assistant: Real estate sales, for example." = 42 chars + 换行
        let limit = HistoryLimit {
            max_turns: None,
            max_chars: Some(50),
        };
        assert_eq!(retained_history(&history(), limit), &history()[3..]);

        // 预算小于最新一轮本身时仍保留最新一轮
        let tiny = HistoryLimit {
            max_turns: None,
            max_chars: Some(1),
        };
        assert_eq!(retained_history(&history(), tiny), &history()[3..]);
    }

    #[test]
    fn test_zero_turns_removes_history() {
        let limit = HistoryLimit {
            max_turns: Some(0),
            max_chars: Some(1000),
        };
        assert!(retained_history(&history(), limit).is_empty());
        let p = assemble_prompt("P", &history(), "Q", limit);
        assert_eq!(p, "P\n\nUser: Q\nAssistant:");
    }
}
