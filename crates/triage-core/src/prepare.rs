use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use triage_types::ToolInvocation;

use crate::{LoopBudgetState, StopReason};

/// One call ready to run, in the order the model requested it.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub invocation: ToolInvocation,
    pub arguments: Value,
    /// `None` when the call cannot be deduplicated (empty tool name).
    pub signature: Option<String>,
    pub round: usize,
    pub cache_eligible: bool,
}

impl PreparedCall {
    pub fn name(&self) -> &str {
        &self.invocation.name
    }

    pub fn id(&self) -> &str {
        &self.invocation.id
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedBatch {
    pub calls: Vec<PreparedCall>,
    /// For each call, the index of the earlier call in this batch with the
    /// same signature. Leaders have `None`.
    pub duplicate_of: Vec<Option<usize>>,
    pub stop_reason: Option<StopReason>,
}

impl PreparedBatch {
    /// Indices of calls that actually need to run.
    pub fn leaders(&self) -> Vec<usize> {
        self.duplicate_of
            .iter()
            .enumerate()
            .filter(|(_, leader)| leader.is_none())
            .map(|(index, _)| index)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrepareLimits {
    /// Times a signature may be executed per turn; 0 disables the check.
    pub max_repeat_per_signature: usize,
    pub max_result_bytes: usize,
    pub cache_results: bool,
}

/// Parses raw model arguments. Empty input is `{}`; anything that is not
/// valid JSON is wrapped as `{"raw": text}`.
pub fn parse_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "raw": raw }))
}

/// JSON rendering with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// `name|canonical-args`, or `None` for a nameless call.
pub fn call_signature(tool_name: &str, arguments: &Value) -> Option<String> {
    let name = tool_name.trim();
    if name.is_empty() {
        return None;
    }
    Some(format!("{name}|{}", canonical_json(arguments)))
}

/// Fills in missing call ids from the tool name, a timestamp and the call's
/// position so every tool-result message can reference its call.
pub fn assign_call_ids(calls: &mut [ToolInvocation], now: DateTime<Utc>) {
    let stamp = now.timestamp_millis();
    for (index, call) in calls.iter_mut().enumerate() {
        if !call.id.trim().is_empty() {
            continue;
        }
        let name = call
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect::<String>();
        let name = if name.is_empty() { "tool".to_string() } else { name };
        call.id = format!("call_{name}_{stamp}_{index}");
    }
}

/// Turns one round of requested calls into a batch. Stops at the first call
/// that would exceed the result-byte budget or the per-signature repeat limit;
/// a stopped batch must not be executed.
pub fn prepare_calls(
    requests: &[ToolInvocation],
    budget: &LoopBudgetState,
    limits: &PrepareLimits,
    round: usize,
) -> PreparedBatch {
    let mut batch = PreparedBatch::default();
    let mut leaders: HashMap<String, usize> = HashMap::new();

    for request in requests {
        if budget.total_result_bytes >= limits.max_result_bytes {
            batch.stop_reason = Some(StopReason::ResultBytes {
                limit: limits.max_result_bytes,
            });
            break;
        }

        let arguments = parse_arguments(&request.raw_arguments);
        let signature = call_signature(&request.name, &arguments);
        let duplicate_of = signature
            .as_ref()
            .and_then(|signature| leaders.get(signature).copied());

        if duplicate_of.is_none() && limits.max_repeat_per_signature > 0 {
            if let Some(signature) = signature.as_ref() {
                if budget.signature_count(signature) >= limits.max_repeat_per_signature {
                    batch.stop_reason = Some(StopReason::RepeatLimit {
                        tool: request.name.clone(),
                        limit: limits.max_repeat_per_signature,
                    });
                    break;
                }
            }
        }

        let index = batch.calls.len();
        if duplicate_of.is_none() {
            if let Some(signature) = signature.as_ref() {
                leaders.insert(signature.clone(), index);
            }
        }
        batch.calls.push(PreparedCall {
            invocation: request.clone(),
            arguments,
            cache_eligible: limits.cache_results && signature.is_some(),
            signature,
            round,
        });
        batch.duplicate_of.push(duplicate_of);
    }

    batch
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn limits() -> PrepareLimits {
        PrepareLimits {
            max_repeat_per_signature: 3,
            max_result_bytes: 1_000_000,
            cache_results: true,
        }
    }

    #[test]
    fn argument_parsing_handles_empty_and_malformed_text() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("  "), json!({}));
        assert_eq!(parse_arguments(r#"{"ns":"kube-system"}"#), json!({"ns": "kube-system"}));
        assert_eq!(parse_arguments("{ns: oops"), json!({"raw": "{ns: oops"}));
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": {"z": 1, "a": [ {"y": 2, "x": 1} ]}, "a": "q\"uote"});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"q\"uote","b":{"a":[{"x":1,"y":2}],"z":1}}"#
        );
    }

    #[test]
    fn signatures_require_a_tool_name() {
        assert_eq!(
            call_signature("get_pods", &json!({"ns": "a"})).as_deref(),
            Some(r#"get_pods|{"ns":"a"}"#)
        );
        assert_eq!(call_signature("  ", &json!({})), None);
    }

    #[test]
    fn missing_ids_are_synthesized_deterministically() {
        let now = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single().expect("timestamp");
        let mut calls = vec![
            ToolInvocation::new("call_abc", "get_pods", "{}"),
            ToolInvocation::new("", "get-logs", "{}"),
        ];
        assign_call_ids(&mut calls, now);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[1].id, format!("call_get_logs_{}_1", now.timestamp_millis()));
    }

    #[test]
    fn duplicates_in_a_batch_point_at_their_leader() {
        let requests = vec![
            ToolInvocation::new("1", "get_pods", r#"{"ns":"a","wide":true}"#),
            ToolInvocation::new("2", "describe", r#"{"pod":"x"}"#),
            ToolInvocation::new("3", "get_pods", r#"{"wide":true,"ns":"a"}"#),
            ToolInvocation::new("4", "", "{}"),
            ToolInvocation::new("5", "", "{}"),
        ];
        let batch = prepare_calls(&requests, &LoopBudgetState::new(), &limits(), 0);
        assert!(batch.stop_reason.is_none());
        assert_eq!(batch.duplicate_of, vec![None, None, Some(0), None, None]);
        assert_eq!(batch.leaders(), vec![0, 1, 3, 4]);
        assert!(!batch.calls[3].cache_eligible);
    }

    #[test]
    fn repeat_limit_rejects_signature_seen_in_earlier_rounds() {
        let mut budget = LoopBudgetState::new();
        budget
            .signature_counts
            .insert(r#"get_pods|{"ns":"a"}"#.to_string(), 1);
        let limits = PrepareLimits {
            max_repeat_per_signature: 1,
            ..limits()
        };
        let requests = vec![
            ToolInvocation::new("1", "describe", r#"{"pod":"x"}"#),
            ToolInvocation::new("2", "get_pods", r#"{"ns":"a"}"#),
        ];
        let batch = prepare_calls(&requests, &budget, &limits, 1);
        assert!(matches!(
            batch.stop_reason,
            Some(StopReason::RepeatLimit { ref tool, limit: 1 }) if tool == "get_pods"
        ));
    }

    #[test]
    fn same_batch_duplicates_do_not_trip_the_repeat_limit() {
        let limits = PrepareLimits {
            max_repeat_per_signature: 1,
            ..limits()
        };
        let requests = vec![
            ToolInvocation::new("1", "get_pods", "{}"),
            ToolInvocation::new("2", "get_pods", "{}"),
        ];
        let batch = prepare_calls(&requests, &LoopBudgetState::new(), &limits, 0);
        assert!(batch.stop_reason.is_none());
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn exhausted_result_bytes_stop_preparation() {
        let mut budget = LoopBudgetState::new();
        budget.total_result_bytes = 2_000;
        let limits = PrepareLimits {
            max_result_bytes: 1_000,
            ..limits()
        };
        let calls = [ToolInvocation::new("1", "get_pods", "{}")];
        let batch = prepare_calls(&calls, &budget, &limits, 2);
        assert_eq!(batch.stop_reason, Some(StopReason::ResultBytes { limit: 1_000 }));
        assert!(batch.is_empty());
    }
}
