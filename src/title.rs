//! 会话标题生成
//!
//! 主路径让 LLM 生成 3-8 词标题（去引号、去空白、截到 60 字符）；
//! 任何错误或空结果时走确定性回退：按优先级匹配法律关键词，否则取前四个词。

use std::sync::Arc;

use crate::llm::GenerationEngine;

/// 标题硬上限（字符）
pub const MAX_TITLE_CHARS: usize = 60;
/// 回退路径「前四个词」的长度上限
const FALLBACK_WORDS_CHARS: usize = 30;
const FALLBACK_WORD_COUNT: usize = 4;
const EMPTY_MESSAGE_TITLE: &str = "New Legal Chat";
const QUOTE_CHARS: &[char] = &['"', '\'', '`', '“', '”', '‘', '’'];

/// 默认关键词（按优先级）
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "contract",
    "employment",
    "tenant",
    "landlord",
    "property",
    "lease",
    "divorce",
    "custody",
    "inheritance",
    "immigration",
    "criminal",
    "injury",
    "debt",
    "bankruptcy",
    "insurance",
    "copyright",
    "trademark",
    "business",
    "dispute",
];

pub struct TitleSynthesizer {
    engine: Arc<GenerationEngine>,
    keywords: Vec<String>,
}

impl TitleSynthesizer {
    pub fn new(engine: Arc<GenerationEngine>, keywords: Vec<String>) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self { engine, keywords }
    }

    pub fn with_default_keywords(engine: Arc<GenerationEngine>) -> Self {
        Self::new(
            engine,
            DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        )
    }

    /// 生成标题；永不失败，结果非空且不超过 60 字符
    pub async fn synthesize(&self, first_message: &str) -> String {
        match self.engine.generate(&title_prompt(first_message)).await {
            Ok(raw) => match clean_title(&raw) {
                Some(title) => return title,
                None => tracing::warn!("title generation returned nothing usable, using fallback"),
            },
            Err(e) => tracing::warn!("title generation failed, using fallback: {}", e),
        }
        fallback_title(first_message, &self.keywords)
    }
}

fn title_prompt(message: &str) -> String {
    format!(
        "Generate a concise legal-chat title of 3 to 8 words for a conversation that starts with the \
         message below. Reply with the title only, without quotes or punctuation at the end.\n\n\
         Message: {}\n\nTitle:",
        message.trim()
    )
}

/// 取首个非空行，去掉两端的引号与空白，截到 60 字符；为空返回 None
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let stripped = line.trim_matches(|c: char| c.is_whitespace() || QUOTE_CHARS.contains(&c));
    if stripped.is_empty() {
        return None;
    }
    let truncated: String = stripped.chars().take(MAX_TITLE_CHARS).collect();
    Some(truncated.trim_end().to_string())
}

/// 确定性回退（无网络调用）
pub fn fallback_title(message: &str, keywords: &[String]) -> String {
    let lower = message.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    for keyword in keywords {
        if words.iter().any(|w| w.contains(keyword.as_str())) {
            return format!("{} Question", capitalize(keyword));
        }
    }

    let first_words = message
        .split_whitespace()
        .take(FALLBACK_WORD_COUNT)
        .collect::<Vec<_>>()
        .join(" ");
    if first_words.is_empty() {
        return EMPTY_MESSAGE_TITLE.to_string();
    }
    if first_words.chars().count() > FALLBACK_WORDS_CHARS {
        let head: String = first_words.chars().take(FALLBACK_WORDS_CHARS).collect();
        format!("{}...", head)
    } else {
        first_words
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
