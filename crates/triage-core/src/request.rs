use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use triage_observability::{emit_event, ObservabilityEvent, ProcessKind};
use triage_providers::{GenerateOptions, ModelClient, ProviderError};
use triage_types::{ChatMessage, EngineEvent, ModelResponse};

use crate::{sleep_or_cancel, EngineError, EventBus, RateLimiter};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the `retry`-th retry (1-based): `initial * factor^(retry-1)`.
    pub fn backoff_for(&self, retry: usize) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as usize) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= u64::MAX as f64 {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(millis.round() as u64)
    }
}

/// Issues model requests with pacing, cancellation and retry/backoff.
#[derive(Clone)]
pub struct RequestEngine {
    client: Arc<dyn ModelClient>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    events: Option<EventBus>,
}

impl RequestEngine {
    pub fn new(
        client: Arc<dyn ModelClient>,
        limiter: Arc<RateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            limiter,
            policy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        options: &GenerateOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, EngineError> {
        let provider_id = self.client.info().id;
        let max_attempts = self.policy.max_retries + 1;
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=max_attempts {
            if let Some(previous) = last_error.as_ref() {
                let delay = previous
                    .retry_after()
                    .unwrap_or_else(|| self.policy.backoff_for(attempt - 1));
                self.announce_retry(attempt, max_attempts, delay, previous);
                sleep_or_cancel(delay, cancel).await?;
            }

            self.limiter.acquire(cancel).await?;

            emit_event(
                Level::DEBUG,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "provider.call.start",
                    component: "request",
                    provider_id: Some(provider_id.as_str()),
                    model_id: options.model.as_deref(),
                    attempt: Some(attempt),
                    status: Some("start"),
                    detail: Some(&format!("messages={}", messages.len())),
                    ..Default::default()
                },
            );

            let started = tokio::time::Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                result = self.client.generate(messages, options) => result,
            };

            match outcome {
                Ok(response) if response.is_empty() => {
                    tracing::warn!(attempt, "model returned an empty response");
                    last_error = Some(ProviderError::transient("model returned an empty response"));
                }
                Ok(response) => {
                    emit_event(
                        Level::INFO,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "provider.call.finish",
                            component: "request",
                            provider_id: Some(provider_id.as_str()),
                            model_id: options.model.as_deref(),
                            attempt: Some(attempt),
                            status: Some("ok"),
                            elapsed_ms: Some(started.elapsed().as_millis() as u64),
                            detail: Some(&format!(
                                "tool_calls={}",
                                response.tool_calls().len()
                            )),
                            ..Default::default()
                        },
                    );
                    return Ok(response);
                }
                Err(ProviderError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) if err.is_retryable() => {
                    if err.is_rate_limited() {
                        tracing::debug!(attempt, "model provider rate limited the request");
                    } else {
                        tracing::warn!(attempt, error = %err, "model request failed");
                    }
                    last_error = Some(err);
                }
                Err(err) => {
                    emit_event(
                        Level::ERROR,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "provider.call.error",
                            component: "request",
                            provider_id: Some(provider_id.as_str()),
                            model_id: options.model.as_deref(),
                            attempt: Some(attempt),
                            status: Some("failed"),
                            error_code: Some("PROVIDER_REQUEST_FAILED"),
                            detail: Some(&err.to_string()),
                            ..Default::default()
                        },
                    );
                    return Err(EngineError::NonRetryable {
                        attempt,
                        source: err,
                    });
                }
            }
        }

        let last_error =
            last_error.unwrap_or_else(|| ProviderError::transient("no request attempts were made"));
        emit_event(
            Level::ERROR,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "provider.call.error",
                component: "request",
                provider_id: Some(provider_id.as_str()),
                model_id: options.model.as_deref(),
                attempt: Some(max_attempts),
                status: Some("exhausted"),
                error_code: Some(if last_error.is_rate_limited() {
                    "RATE_LIMIT_EXCEEDED"
                } else {
                    "PROVIDER_RETRIES_EXHAUSTED"
                }),
                detail: Some(&last_error.to_string()),
                ..Default::default()
            },
        );
        match last_error {
            ProviderError::RateLimited { message, .. } => Err(EngineError::RateLimitExhausted {
                attempts: max_attempts,
                message,
            }),
            source => Err(EngineError::RetriesExhausted {
                attempts: max_attempts,
                source,
            }),
        }
    }

    fn announce_retry(
        &self,
        attempt: usize,
        max_attempts: usize,
        delay: Duration,
        previous: &ProviderError,
    ) {
        let Some(events) = self.events.as_ref() else {
            return;
        };
        let message = if previous.is_rate_limited() {
            format!(
                "Rate limited by the model provider. \
                 Waiting {:.1}s before retrying ({attempt}/{max_attempts}).",
                delay.as_secs_f64()
            )
        } else {
            format!(
                "Model request failed: {previous}. Retrying in {:.1}s ({attempt}/{max_attempts}).",
                delay.as_secs_f64()
            )
        };
        events.publish(EngineEvent::new(
            "provider.retry",
            json!({
                "attempt": attempt,
                "maxAttempts": max_attempts,
                "delayMs": delay.as_millis() as u64,
                "rateLimited": previous.is_rate_limited(),
                "message": message,
            }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    use triage_types::ProviderInfo;

    use super::*;
    use crate::ThrottlePolicy;

    struct Scripted {
        replies: Mutex<VecDeque<Result<ModelResponse, ProviderError>>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<ModelResponse, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl ModelClient for Scripted {
        fn info(&self) -> ProviderInfo {
            ProviderInfo {
                id: "scripted".to_string(),
                name: "Scripted".to_string(),
                models: Vec::new(),
            }
        }

        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _options: &GenerateOptions,
        ) -> Result<ModelResponse, ProviderError> {
            *self.calls.lock() += 1;
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::fatal("script exhausted")))
        }
    }

    fn engine(client: Arc<Scripted>, max_retries: usize) -> RequestEngine {
        RequestEngine::new(
            client,
            Arc::new(RateLimiter::new(ThrottlePolicy::Disabled)),
            RetryPolicy {
                max_retries,
                initial_backoff: Duration::from_secs(1),
                backoff_factor: 2.0,
            },
        )
    }

    #[test]
    fn backoff_grows_geometrically() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_then_succeed() {
        let client = Scripted::new(vec![
            Err(ProviderError::transient("upstream 503")),
            Err(ProviderError::transient("upstream 503")),
            Ok(ModelResponse::text("pods are pending on node pressure")),
        ]);
        let started = Instant::now();
        let response = engine(client.clone(), 3)
            .generate(
                &[ChatMessage::user("hi")],
                &GenerateOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("response");
        assert_eq!(response.content(), "pods are pending on node pressure");
        assert_eq!(client.calls(), 3);
        // 1s + 2s of backoff on the paused clock.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_overrides_backoff() {
        let client = Scripted::new(vec![
            Err(ProviderError::RateLimited {
                message: "slow down".to_string(),
                retry_after: Some(Duration::from_secs(20)),
            }),
            Ok(ModelResponse::text("done")),
        ]);
        let started = Instant::now();
        engine(client.clone(), 3)
            .generate(
                &[ChatMessage::user("hi")],
                &GenerateOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("response");
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_responses_are_retried() {
        let client = Scripted::new(vec![
            Ok(ModelResponse::text("")),
            Ok(ModelResponse::text("answer")),
        ]);
        let response = engine(client.clone(), 2)
            .generate(
                &[ChatMessage::user("hi")],
                &GenerateOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect("response");
        assert_eq!(response.content(), "answer");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_rate_limit_produces_dedicated_error() {
        let client = Scripted::new(vec![
            Err(ProviderError::rate_limited("quota")),
            Err(ProviderError::rate_limited("quota")),
            Err(ProviderError::rate_limited("quota")),
        ]);
        let err = engine(client.clone(), 2)
            .generate(
                &[ChatMessage::user("hi")],
                &GenerateOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("exhausted");
        assert!(matches!(err, EngineError::RateLimitExhausted { attempts: 3, .. }));
        assert!(err.to_string().contains("after 3 attempt(s)"));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transient_errors_report_attempt_count() {
        let client = Scripted::new(vec![
            Err(ProviderError::transient("boom")),
            Err(ProviderError::transient("boom")),
        ]);
        let err = engine(client, 1)
            .generate(
                &[ChatMessage::user("hi")],
                &GenerateOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("exhausted");
        assert!(matches!(err, EngineError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let client = Scripted::new(vec![Err(ProviderError::fatal("invalid api key"))]);
        let err = engine(client.clone(), 5)
            .generate(
                &[ChatMessage::user("hi")],
                &GenerateOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .expect_err("fatal");
        assert!(matches!(err, EngineError::NonRetryable { attempt: 1, .. }));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let client = Scripted::new(vec![
            Err(ProviderError::transient("boom")),
            Ok(ModelResponse::text("never")),
        ]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = engine(client.clone(), 3)
            .generate(&[ChatMessage::user("hi")], &GenerateOptions::default(), &cancel)
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
        assert_eq!(client.calls(), 1);
    }
}
