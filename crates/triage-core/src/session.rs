use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use triage_types::{ChatMessage, SessionEvent};

use crate::{EngineError, Orchestrator, TurnOutcome};

/// Conversation carried across turns plus the append-only turn history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    messages: Vec<ChatMessage>,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(system_prompt: Option<&str>) -> Self {
        let messages = system_prompt
            .map(str::trim)
            .filter(|prompt| !prompt.is_empty())
            .map(|prompt| vec![ChatMessage::system(prompt)])
            .unwrap_or_default();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            messages,
            events: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn events(&self) -> &[SessionEvent] {
        &self.events
    }

    /// Message list for a new turn: the history followed by the user prompt.
    pub fn messages_for(&self, prompt: &str) -> Vec<ChatMessage> {
        let mut messages = self.messages.clone();
        messages.push(ChatMessage::user(prompt));
        messages
    }

    pub fn record_turn(&mut self, prompt: &str, outcome: &TurnOutcome) {
        self.messages = outcome.messages.clone();
        self.events.push(SessionEvent::new(
            prompt,
            outcome.tool_calls.clone(),
            outcome.answer.clone(),
        ));
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, raw).await?;
        Ok(())
    }
}

impl Orchestrator {
    /// Runs one turn against `session`. The session is only updated when the
    /// turn completes; a cancelled or failed turn leaves it untouched.
    pub async fn run_session_turn(
        &self,
        session: &mut Session,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let outcome = self.run_turn(session.messages_for(prompt), cancel).await?;
        session.record_turn(prompt, &outcome);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use triage_types::{ModelResponse, ToolCallData};

    use super::*;
    use crate::{DisplayState, LoopMetrics};

    fn outcome(messages: Vec<ChatMessage>, answer: &str) -> TurnOutcome {
        TurnOutcome {
            answer: answer.to_string(),
            response: ModelResponse::text(answer),
            tool_calls: vec![ToolCallData {
                name: "get_pods".to_string(),
                arguments: json!({"namespace": "default"}),
                result: "web-1 Running".to_string(),
                raw_bytes: 13,
                artifact_path: None,
                artifact_hash: None,
                cache_hit: false,
            }],
            messages,
            display: DisplayState::default(),
            stop_reason: None,
            metrics: LoopMetrics::default(),
        }
    }

    #[test]
    fn system_prompt_seeds_the_history() {
        let session = Session::new(Some("You are a cluster triage assistant."));
        assert_eq!(session.messages().len(), 1);
        assert!(Session::new(Some("   ")).messages().is_empty());
    }

    #[tokio::test]
    async fn record_turn_appends_one_event_and_persists() {
        let mut session = Session::new(None);
        let mut messages = session.messages_for("is web up?");
        messages.push(ChatMessage::assistant("Yes, web-1 is running."));
        session.record_turn("is web up?", &outcome(messages, "Yes, web-1 is running."));

        assert_eq!(session.events().len(), 1);
        assert_eq!(session.events()[0].user_prompt, "is web up?");
        assert_eq!(session.events()[0].tool_calls.len(), 1);
        assert_eq!(session.messages().len(), 2);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions").join(format!("{}.json", session.id));
        session.save(&path).await.expect("save");
        let restored: Session =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(restored.events().len(), 1);
        assert_eq!(restored.id, session.id);
    }
}
