use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::try_join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use triage_tools::ToolExecutor;

use crate::{sleep_or_cancel, ArtifactRef, EngineError, PreparedBatch, PreparedCall};

/// Signature → result text, shared by every round of one turn.
#[derive(Clone, Default)]
pub struct ResultCache {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, signature: &str) -> Option<String> {
        self.inner.read().await.get(signature).cloned()
    }

    pub async fn insert(&self, signature: impl Into<String>, result: impl Into<String>) {
        self.inner.write().await.insert(signature.into(), result.into());
    }
}

/// Outcome of one requested call. Failed calls carry the error text as their
/// result so the model can read it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedCall {
    pub prepared: PreparedCall,
    pub result: String,
    pub error: Option<String>,
    pub cache_hit: bool,
    pub artifact: Option<ArtifactRef>,
}

impl ExecutedCall {
    fn success(prepared: PreparedCall, result: String, cache_hit: bool) -> Self {
        Self {
            prepared,
            result,
            error: None,
            cache_hit,
            artifact: None,
        }
    }

    fn failure(prepared: PreparedCall, error: String) -> Self {
        Self {
            prepared,
            result: error.clone(),
            error: Some(error),
            cache_hit: false,
            artifact: None,
        }
    }

    pub fn with_artifact(self, artifact: ArtifactRef) -> Self {
        Self {
            artifact: Some(artifact),
            ..self
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn artifact_path(&self) -> Option<PathBuf> {
        self.artifact.as_ref().map(|artifact| artifact.path.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSettings {
    /// Worker count; 1 runs calls one after another.
    pub parallelism: usize,
    /// Courtesy delay between sequential calls, or once per parallel batch.
    pub call_delay: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            call_delay: Duration::ZERO,
        }
    }
}

#[derive(Clone)]
pub struct ParallelExecutor {
    tools: Arc<dyn ToolExecutor>,
    settings: ExecutionSettings,
}

impl ParallelExecutor {
    pub fn new(tools: Arc<dyn ToolExecutor>, settings: ExecutionSettings) -> Self {
        Self { tools, settings }
    }

    pub fn tools(&self) -> &Arc<dyn ToolExecutor> {
        &self.tools
    }

    /// Runs each unique call of `batch` once and returns one result per
    /// requested call, in request order. Duplicates reuse their leader's result.
    pub async fn execute_batch(
        &self,
        batch: &PreparedBatch,
        cache: &ResultCache,
        cancel: &CancellationToken,
    ) -> Result<Vec<ExecutedCall>, EngineError> {
        let leaders = batch.leaders();
        let slots: Vec<OnceLock<ExecutedCall>> =
            (0..batch.len()).map(|_| OnceLock::new()).collect();

        let mut pending = Vec::with_capacity(leaders.len());
        for index in leaders {
            let call = &batch.calls[index];
            let cached = match call.signature.as_deref() {
                Some(signature) if call.cache_eligible => cache.get(signature).await,
                _ => None,
            };
            match cached {
                Some(result) => {
                    let _ = slots[index].set(ExecutedCall::success(call.clone(), result, true));
                }
                None => pending.push(index),
            }
        }

        let workers = self.settings.parallelism.max(1).min(pending.len());
        if workers <= 1 {
            for (position, index) in pending.iter().enumerate() {
                if position > 0 {
                    sleep_or_cancel(self.settings.call_delay, cancel).await?;
                }
                let executed = self.run_one(&batch.calls[*index], cache, cancel).await?;
                let _ = slots[*index].set(executed);
            }
        } else {
            sleep_or_cancel(self.settings.call_delay, cancel).await?;
            let cursor = AtomicUsize::new(0);
            let pending = &pending;
            let slots = &slots;
            let cursor = &cursor;
            try_join_all((0..workers).map(|_| async move {
                loop {
                    let next = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(index) = pending.get(next).copied() else {
                        return Ok::<(), EngineError>(());
                    };
                    let executed = self.run_one(&batch.calls[index], cache, cancel).await?;
                    let _ = slots[index].set(executed);
                }
            }))
            .await?;
        }

        let leader_results: Vec<Option<ExecutedCall>> =
            slots.into_iter().map(OnceLock::into_inner).collect();
        let mut out = Vec::with_capacity(batch.len());
        for (index, call) in batch.calls.iter().enumerate() {
            let executed = match batch.duplicate_of[index] {
                Some(leader) => {
                    let source = leader_results
                        .get(leader)
                        .and_then(Option::as_ref)
                        .ok_or_else(|| {
                            anyhow::anyhow!("no result recorded for leader of call {index}")
                        })?;
                    ExecutedCall {
                        prepared: call.clone(),
                        cache_hit: true,
                        ..source.clone()
                    }
                }
                None => leader_results
                    .get(index)
                    .cloned()
                    .flatten()
                    .ok_or_else(|| anyhow::anyhow!("no result recorded for call {index}"))?,
            };
            out.push(executed);
        }
        Ok(out)
    }

    async fn run_one(
        &self,
        call: &PreparedCall,
        cache: &ResultCache,
        cancel: &CancellationToken,
    ) -> Result<ExecutedCall, EngineError> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.tools.execute(call.name(), call.arguments.clone(), cancel.clone()) => {
                result
            }
        };
        match outcome {
            Ok(result) => {
                if let (true, Some(signature)) = (call.cache_eligible, call.signature.as_ref()) {
                    cache.insert(signature.clone(), result.clone()).await;
                }
                Ok(ExecutedCall::success(call.clone(), result, false))
            }
            Err(_) if cancel.is_cancelled() => Err(EngineError::Cancelled),
            Err(err) => {
                tracing::warn!(tool = call.name(), error = %err, "tool call failed");
                Ok(ExecutedCall::failure(
                    call.clone(),
                    format!("Error running `{}`: {err:#}", call.name()),
                ))
            }
        }
    }
}
