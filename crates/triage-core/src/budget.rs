use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use triage_types::ToolInvocation;

use crate::{call_signature, canonical_json, parse_arguments, PreparedBatch};

/// Number of recent plan fingerprints kept for cycle detection.
pub const PLAN_HISTORY_LEN: usize = 16;

/// Why the tool loop stopped requesting tools for this turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    IterationLimit { limit: usize },
    Stalled { repeats: usize },
    Cycle { occurrences: usize },
    ToolCallBudget { limit: usize },
    ResultBytes { limit: usize },
    RepeatLimit { tool: String, limit: usize },
    NoProgress { rounds: usize },
}

impl StopReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::IterationLimit { .. } => "iteration_limit",
            Self::Stalled { .. } => "stalled",
            Self::Cycle { .. } => "cycle",
            Self::ToolCallBudget { .. } => "tool_call_budget",
            Self::ResultBytes { .. } => "result_bytes",
            Self::RepeatLimit { .. } => "repeat_limit",
            Self::NoProgress { .. } => "no_progress",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IterationLimit { limit } => {
                write!(f, "reached the tool iteration limit ({limit} rounds)")
            }
            Self::Stalled { repeats } => write!(
                f,
                "stalled after the same tool plan was requested {repeats} times in a row"
            ),
            Self::Cycle { occurrences } => write!(
                f,
                "detected a cycle: a previous tool plan came back {occurrences} times"
            ),
            Self::ToolCallBudget { limit } => {
                write!(f, "used up the tool call budget ({limit} calls)")
            }
            Self::ResultBytes { limit } => {
                write!(f, "used up the tool result budget ({limit} bytes)")
            }
            Self::RepeatLimit { tool, limit } => write!(
                f,
                "hit the repeat limit for `{tool}` (same call allowed {limit} times)"
            ),
            Self::NoProgress { rounds } => {
                write!(f, "made no progress for {rounds} rounds (no new evidence)")
            }
        }
    }
}

/// What the budget saw when a new plan fingerprint was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanObservation {
    /// Consecutive rounds ending with this one that used the same plan.
    pub consecutive_repeats: usize,
    /// Earlier appearances in the recent history, not counting this one.
    pub prior_occurrences: usize,
    /// Whether the immediately preceding plan was the same.
    pub repeats_previous: bool,
}

impl PlanObservation {
    pub fn is_stall(&self, threshold: usize) -> bool {
        threshold > 0 && self.consecutive_repeats >= threshold
    }

    pub fn is_cycle(&self, threshold: usize) -> bool {
        threshold > 0 && !self.repeats_previous && self.prior_occurrences >= threshold
    }
}

/// Per-turn accounting for the tool loop. Created fresh for every turn.
#[derive(Debug, Clone, Default)]
pub struct LoopBudgetState {
    pub tool_call_iterations: usize,
    pub total_tool_calls: usize,
    pub total_result_bytes: usize,
    pub signature_counts: HashMap<String, usize>,
    pub unique_signatures: HashSet<String>,
    pub repeated_calls: usize,
    pub cache_hits: usize,
    pub last_plan_fingerprint: Option<String>,
    pub repeated_plan_count: usize,
    pub plan_history: VecDeque<String>,
    pub seen_evidence: HashSet<String>,
    pub no_progress_rounds: usize,
    pub stop_reason: Option<StopReason>,
}

impl LoopBudgetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `reason` unless a stop reason was already set.
    pub fn set_stop(&mut self, reason: StopReason) -> bool {
        if self.stop_reason.is_some() {
            return false;
        }
        self.stop_reason = Some(reason);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_reason.is_some()
    }

    pub fn signature_count(&self, signature: &str) -> usize {
        self.signature_counts.get(signature).copied().unwrap_or(0)
    }

    pub fn remaining_tool_calls(&self, max_total: usize) -> usize {
        max_total.saturating_sub(self.total_tool_calls)
    }

    pub fn observe_plan(&mut self, fingerprint: &str) -> PlanObservation {
        let prior_occurrences = self
            .plan_history
            .iter()
            .filter(|entry| entry.as_str() == fingerprint)
            .count();
        let repeats_previous = self.last_plan_fingerprint.as_deref() == Some(fingerprint);
        self.repeated_plan_count = if repeats_previous {
            self.repeated_plan_count + 1
        } else {
            1
        };
        self.last_plan_fingerprint = Some(fingerprint.to_string());
        self.plan_history.push_back(fingerprint.to_string());
        while self.plan_history.len() > PLAN_HISTORY_LEN {
            self.plan_history.pop_front();
        }
        PlanObservation {
            consecutive_repeats: self.repeated_plan_count,
            prior_occurrences,
            repeats_previous,
        }
    }

    /// Books the signatures of an accepted batch. Same-batch duplicates count
    /// as repeated calls but only the leader bumps the signature counter.
    pub fn commit_batch(&mut self, batch: &PreparedBatch) {
        for (index, call) in batch.calls.iter().enumerate() {
            if batch.duplicate_of[index].is_some() {
                self.repeated_calls += 1;
                continue;
            }
            let Some(signature) = call.signature.as_ref() else {
                continue;
            };
            let count = self.signature_counts.entry(signature.clone()).or_insert(0);
            if *count > 0 {
                self.repeated_calls += 1;
            }
            *count += 1;
            self.unique_signatures.insert(signature.clone());
        }
    }

    /// Records one integration round's evidence hashes. Returns true when at
    /// least one of them had not been seen before in this turn.
    pub fn record_evidence<I>(&mut self, hashes: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let mut new_evidence = false;
        for hash in hashes {
            if self.seen_evidence.insert(hash) {
                new_evidence = true;
            }
        }
        if new_evidence {
            self.no_progress_rounds = 0;
        } else {
            self.no_progress_rounds += 1;
        }
        new_evidence
    }

    pub fn metrics(&self) -> LoopMetrics {
        LoopMetrics {
            tool_call_iterations: self.tool_call_iterations,
            total_tool_calls: self.total_tool_calls,
            unique_signatures: self.unique_signatures.len(),
            repeated_calls: self.repeated_calls,
            cache_hits: self.cache_hits,
            total_result_bytes: self.total_result_bytes,
            stop_reason: self
                .stop_reason
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        }
    }
}

/// Summary logged at the end of every turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopMetrics {
    pub tool_call_iterations: usize,
    pub total_tool_calls: usize,
    pub unique_signatures: usize,
    pub repeated_calls: usize,
    pub cache_hits: usize,
    pub total_result_bytes: usize,
    /// Empty when the loop ended because the model stopped asking for tools.
    pub stop_reason: String,
}

pub fn sha256_hex(input: &[u8]) -> String {
    to_hex(&Sha256::digest(input))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Fingerprint of the ordered list of requested calls in one round.
pub fn plan_fingerprint(calls: &[ToolInvocation]) -> String {
    let mut hasher = Sha256::new();
    for call in calls {
        let arguments = parse_arguments(&call.raw_arguments);
        let key = call_signature(&call.name, &arguments)
            .unwrap_or_else(|| format!("{}|{}", call.name, call.raw_arguments));
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    to_hex(&hasher.finalize())
}

/// Hash of one piece of evidence: tool name, canonical arguments and result.
pub fn evidence_hash(tool_name: &str, arguments: &Value, result: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(arguments).as_bytes());
    hasher.update([0u8]);
    hasher.update(result.as_bytes());
    to_hex(&hasher.finalize())
}
