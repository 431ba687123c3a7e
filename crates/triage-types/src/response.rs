use serde::{Deserialize, Serialize};

use crate::ToolInvocation;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelChoice {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Result of one model invocation: zero or more choices.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelResponse {
    #[serde(default)]
    pub choices: Vec<ModelChoice>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            choices: vec![ModelChoice {
                content: Some(content.into()),
                tool_calls: Vec::new(),
            }],
            usage: None,
        }
    }

    pub fn with_tool_calls(content: Option<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            choices: vec![ModelChoice {
                content,
                tool_calls,
            }],
            usage: None,
        }
    }

    /// Text of all choices joined with newlines, skipping empty ones.
    pub fn content(&self) -> String {
        self.choices
            .iter()
            .filter_map(|choice| choice.content.as_deref())
            .filter(|text| !text.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> Vec<ToolInvocation> {
        self.choices
            .iter()
            .flat_map(|choice| choice.tool_calls.iter().cloned())
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.choices.iter().any(|choice| !choice.tool_calls.is_empty())
    }

    /// True when the provider "succeeded" but produced nothing usable.
    pub fn is_empty(&self) -> bool {
        !self.has_tool_calls() && self.content().trim().is_empty()
    }
}
