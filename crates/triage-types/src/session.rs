use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ToolCallData;

/// One completed user turn. Appended once, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_prompt: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallData>,
    pub ai_response: String,
}

impl SessionEvent {
    pub fn new(
        user_prompt: impl Into<String>,
        tool_calls: Vec<ToolCallData>,
        ai_response: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_prompt: user_prompt.into(),
            tool_calls,
            ai_response: ai_response.into(),
        }
    }
}
