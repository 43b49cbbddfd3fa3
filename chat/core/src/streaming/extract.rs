//! Content Fragment Extraction
//!
//! Gateways relay several provider formats over the same event stream. Rather
//! than modelling every schema, each known shape gets a small total function
//! that either finds a text fragment or returns `None`; the rules are tried in
//! order and the first non-empty fragment wins.
//!
//! | Order | Shape | Path |
//! |-------|-------|------|
//! | 1 | OpenAI chat chunk | `choices[0].delta.content` |
//! | 2 | Anthropic delta | `delta.text` |
//! | 3 | Plain | `content` |

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single extraction rule
pub type ExtractionRule = fn(&Value) -> Option<&str>;

/// OpenAI-style nested delta
#[must_use]
pub fn openai_delta(value: &Value) -> Option<&str> {
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

/// Anthropic-style delta text
#[must_use]
pub fn anthropic_delta(value: &Value) -> Option<&str> {
    value.get("delta")?.get("text")?.as_str()
}

/// Top-level content string
#[must_use]
pub fn direct_content(value: &Value) -> Option<&str> {
    value.get("content")?.as_str()
}

/// The built-in rules in priority order
pub const DEFAULT_RULES: &[ExtractionRule] = &[openai_delta, anthropic_delta, direct_content];

/// Ordered cascade of extraction rules
#[derive(Clone, Debug)]
pub struct ContentExtractor {
    rules: Vec<ExtractionRule>,
}

impl Default for ContentExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.to_vec())
    }
}

impl ContentExtractor {
    /// Create a cascade from explicit rules
    #[must_use]
    pub fn new(rules: Vec<ExtractionRule>) -> Self {
        Self { rules }
    }

    /// Add a rule at the lowest priority
    #[must_use]
    pub fn with_rule(mut self, rule: ExtractionRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// First non-empty fragment any rule finds
    #[must_use]
    pub fn extract<'a>(&self, value: &'a Value) -> Option<&'a str> {
        self.rules
            .iter()
            .find_map(|rule| rule(value).filter(|text| !text.is_empty()))
    }
}

/// Token accounting reported by the gateway
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed
    pub prompt_tokens: Option<u64>,
    /// Completion tokens produced
    pub completion_tokens: Option<u64>,
}

impl TokenUsage {
    /// Total tokens, when both counts are known
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        Some(self.prompt_tokens? + self.completion_tokens?)
    }

    /// Overlay counts found in a later payload
    pub fn merge(&mut self, other: TokenUsage) {
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
    }
}

/// Usage counts at the top level or inside a `usage` object
#[must_use]
pub fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let read = |v: &Value| TokenUsage {
        prompt_tokens: v.get("prompt_tokens").and_then(Value::as_u64),
        completion_tokens: v.get("completion_tokens").and_then(Value::as_u64),
    };

    let mut usage = read(value);
    if let Some(nested) = value.get("usage") {
        usage.merge(read(nested));
    }

    (usage != TokenUsage::default()).then_some(usage)
}
