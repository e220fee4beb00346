//! Model invocation: one document in, raw model text (or a classified
//! failure) out.
//!
//! [`ModelInvoker`] owns the retry loop, the per-attempt timeout and the
//! request deadline. The concrete model sits behind [`ExtractionBackend`] so
//! the loop can be driven by a scripted backend in tests; [`LlmBackend`] is
//! the production implementation over an `edgequake_llm` provider.
//!
//! ## Attempt loop
//!
//! ```text
//! ┌─► cancelled? ── yes ──► Cancelled
//! │   deadline passed? ── yes ──► Timeout
//! │   attempt (bounded by min(api_timeout, deadline), raced with cancel)
//! │     ├─ Ok ──► RawModelOutput
//! │     ├─ permanent ──► Permanent
//! │     └─ transient / attempt timeout
//! │          └─ RetryPolicy::decide
//! │               ├─ Exhausted ──► ServiceUnavailable
//! │               ├─ OutOfBudget ──► Timeout
//! └────────────── Retry { delay }: sleep (raced with cancel)
//! ```

use crate::cancel::CancelSignal;
use crate::error::InvocationFailure;
use crate::pipeline::encode::DocumentPayload;
use crate::pipeline::retry::{RetryDecision, RetryPolicy};
use crate::progress::{ExtractionProgressCallback, PipelineStage};
use crate::prompts::{text_instruction, ATTACHMENT_INSTRUCTION};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, warn};

/// Everything the backend needs for one call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub payload: DocumentPayload,
}

/// What a backend returns from one successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// Whether a failed call is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// A single failed backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendError {
    pub class: ErrorClass,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }
}

/// Raw, unparsed model output plus call metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RawModelOutput {
    pub content: String,
    pub model_version: String,
    /// Wall-clock time from the first attempt to the successful reply,
    /// backoff sleeps included.
    pub latency: Duration,
    /// 1-indexed number of the attempt that succeeded.
    pub attempts: u32,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// The seam between the retry loop and a concrete model.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    /// Identifier reported in `meta.model_version`.
    fn model_version(&self) -> &str;

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, BackendError>;
}

/// Classify a provider error message.
///
/// Rate limiting, timeouts, 5xx responses and connection trouble are
/// transient. Everything else (auth, malformed request, content policy) is
/// permanent.
pub fn classify_llm_error(message: &str) -> ErrorClass {
    let m = message.to_ascii_lowercase();
    const TRANSIENT: [&str; 16] = [
        "429",
        "rate limit",
        "rate_limit",
        "too many requests",
        "timeout",
        "timed out",
        "500",
        "502",
        "503",
        "504",
        "overloaded",
        "unavailable",
        "connection",
        "network",
        "temporarily",
        "internal server error",
    ];
    if TRANSIENT.iter().any(|needle| m.contains(needle)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// [`ExtractionBackend`] over an `edgequake_llm` chat provider.
pub struct LlmBackend {
    provider: Arc<dyn LLMProvider>,
    model_version: String,
    temperature: f32,
    max_tokens: usize,
}

impl LlmBackend {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model_version: impl Into<String>,
        temperature: f32,
        max_tokens: usize,
    ) -> Self {
        Self {
            provider,
            model_version: model_version.into(),
            temperature,
            max_tokens,
        }
    }

    fn build_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// System prompt first, then one user turn carrying the document.
fn build_messages(request: &ModelRequest) -> Vec<ChatMessage> {
    let user = match &request.payload {
        DocumentPayload::Attachment { image, .. } => {
            ChatMessage::user_with_images(ATTACHMENT_INSTRUCTION, vec![image.clone()])
        }
        DocumentPayload::Text(text) => ChatMessage::user_with_images(text_instruction(text), vec![]),
    };
    vec![ChatMessage::system(request.system_prompt.as_str()), user]
}

#[async_trait]
impl ExtractionBackend for LlmBackend {
    fn model_version(&self) -> &str {
        &self.model_version
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, BackendError> {
        let messages = build_messages(request);
        let options = self.build_options();
        match self.provider.chat(&messages, Some(&options)).await {
            Ok(response) => Ok(ModelReply {
                content: response.content,
                input_tokens: response.prompt_tokens,
                output_tokens: response.completion_tokens,
            }),
            Err(e) => {
                let message = e.to_string();
                Err(BackendError {
                    class: classify_llm_error(&message),
                    message,
                })
            }
        }
    }
}

/// Roughly 30 years; stands in for "no deadline" when `budget` overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + budget`, saturating to a far-future instant instead of panicking.
pub fn deadline_after(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Drives one request's invocation sequence against a backend.
#[derive(Clone)]
pub struct ModelInvoker {
    backend: Arc<dyn ExtractionBackend>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl ModelInvoker {
    pub fn new(backend: Arc<dyn ExtractionBackend>, policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            backend,
            policy,
            attempt_timeout,
        }
    }

    pub fn model_version(&self) -> &str {
        self.backend.model_version()
    }

    /// Call the model until it answers, fails permanently, runs out of
    /// retries, hits `deadline`, or `cancel` fires.
    ///
    /// Attempts are strictly sequential. No attempt or backoff sleep starts
    /// once cancellation is observed or the deadline has passed.
    pub async fn invoke(
        &self,
        request: &ModelRequest,
        deadline: Instant,
        cancel: &CancelSignal,
        progress: &dyn ExtractionProgressCallback,
    ) -> Result<RawModelOutput, InvocationFailure> {
        let start = Instant::now();
        let elapsed_ms = || start.elapsed().as_millis() as u64;
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(InvocationFailure::Cancelled { attempts });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(InvocationFailure::Timeout {
                    elapsed_ms: elapsed_ms(),
                    attempts,
                });
            }

            attempts += 1;
            progress.on_stage(PipelineStage::Invoking);
            let attempt_deadline = deadline_after(now, self.attempt_timeout).min(deadline);
            debug!("Attempt {} started", attempts);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Attempt {} abandoned on cancellation", attempts);
                    return Err(InvocationFailure::Cancelled { attempts });
                }
                r = timeout_at(attempt_deadline, self.backend.complete(request)) => r,
            };

            let last_error = match result {
                Ok(Ok(reply)) => {
                    let latency = start.elapsed();
                    debug!(
                        "Attempt {}: {} input tokens, {} output tokens, {:?}",
                        attempts, reply.input_tokens, reply.output_tokens, latency
                    );
                    return Ok(RawModelOutput {
                        content: reply.content,
                        model_version: self.backend.model_version().to_string(),
                        latency,
                        attempts,
                        input_tokens: reply.input_tokens,
                        output_tokens: reply.output_tokens,
                    });
                }
                Ok(Err(e)) if e.class == ErrorClass::Permanent => {
                    warn!("Attempt {} failed permanently: {}", attempts, e.message);
                    return Err(InvocationFailure::Permanent {
                        attempts,
                        message: e.message,
                    });
                }
                Ok(Err(e)) => e.message,
                Err(_) if attempt_deadline >= deadline => {
                    warn!("Attempt {} cut off by the request deadline", attempts);
                    return Err(InvocationFailure::Timeout {
                        elapsed_ms: elapsed_ms(),
                        attempts,
                    });
                }
                Err(_) => format!(
                    "attempt timed out after {}ms",
                    self.attempt_timeout.as_millis()
                ),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self
                .policy
                .decide(attempts - 1, remaining, self.policy.sample_jitter())
            {
                RetryDecision::Retry { delay } => {
                    warn!(
                        "Attempt {} failed: {}; retry {}/{} in {}ms",
                        attempts,
                        last_error,
                        attempts,
                        self.policy.max_retries,
                        delay.as_millis()
                    );
                    progress.on_retry(attempts, delay, &last_error);
                    progress.on_stage(PipelineStage::BackingOff);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(InvocationFailure::Cancelled { attempts });
                        }
                        _ = sleep(delay) => {}
                    }
                }
                RetryDecision::Exhausted => {
                    warn!("Giving up after {} attempts: {}", attempts, last_error);
                    return Err(InvocationFailure::ServiceUnavailable {
                        attempts,
                        retries: attempts - 1,
                        last_error,
                    });
                }
                RetryDecision::OutOfBudget { delay, remaining } => {
                    warn!(
                        "Backoff of {}ms would reach the deadline ({}ms left); aborting",
                        delay.as_millis(),
                        remaining.as_millis()
                    );
                    return Err(InvocationFailure::Timeout {
                        elapsed_ms: elapsed_ms(),
                        attempts,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::encode::encode_text;
    use crate::progress::NoopProgressCallback;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a fixed script, one entry per call, each after `latency`.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, BackendError>>>,
        latency: Duration,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Self::slow(script, Duration::ZERO)
        }

        fn slow(script: Vec<Result<String, BackendError>>, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                latency,
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ExtractionBackend for Scripted {
        fn model_version(&self) -> &str {
            "scripted-1"
        }

        async fn complete(&self, _request: &ModelRequest) -> Result<ModelReply, BackendError> {
            *self.calls.lock().unwrap() += 1;
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::permanent("script exhausted")));
            next.map(|content| ModelReply {
                content,
                input_tokens: 10,
                output_tokens: 20,
            })
        }
    }

    fn request() -> ModelRequest {
        ModelRequest {
            system_prompt: "extract".into(),
            payload: encode_text(b"INVOICE 1".to_vec()),
        }
    }

    fn invoker(backend: Arc<Scripted>) -> ModelInvoker {
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        ModelInvoker::new(backend, policy, Duration::from_secs(20))
    }

    fn in_secs(s: u64) -> Instant {
        Instant::now() + Duration::from_secs(s)
    }

    #[test]
    fn classification() {
        assert_eq!(classify_llm_error("HTTP 429 Too Many Requests"), ErrorClass::Transient);
        assert_eq!(classify_llm_error("Rate limit exceeded"), ErrorClass::Transient);
        assert_eq!(classify_llm_error("upstream 503"), ErrorClass::Transient);
        assert_eq!(classify_llm_error("request timed out"), ErrorClass::Transient);
        assert_eq!(classify_llm_error("model is overloaded"), ErrorClass::Transient);
        assert_eq!(classify_llm_error("401 Unauthorized: invalid api key"), ErrorClass::Permanent);
        assert_eq!(classify_llm_error("400 Bad Request"), ErrorClass::Permanent);
        assert_eq!(classify_llm_error("content policy violation"), ErrorClass::Permanent);
    }

    #[test]
    fn text_payload_is_inlined_in_user_turn() {
        let messages = build_messages(&request());
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn deadline_saturates_instead_of_overflowing() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(5)), now + Duration::from_secs(5));
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(86_400 * 365));
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_attempt_timeout_is_accepted() {
        let backend = Scripted::new(vec![Err(BackendError::transient("HTTP 503")), Ok("{}".into())]);
        let invoker = ModelInvoker::new(
            backend.clone(),
            RetryPolicy {
                jitter: false,
                ..Default::default()
            },
            Duration::MAX,
        );
        let deadline = deadline_after(Instant::now(), Duration::MAX);
        let out = invoker
            .invoke(&request(), deadline, &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success() {
        let backend = Scripted::new(vec![Ok("{}".into())]);
        let out = invoker(backend.clone())
            .invoke(&request(), in_secs(20), &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap();
        assert_eq!(out.content, "{}");
        assert_eq!(out.attempts, 1);
        assert_eq!(out.model_version, "scripted-1");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_two_transient_failures() {
        let backend = Scripted::new(vec![
            Err(BackendError::transient("HTTP 503")),
            Err(BackendError::transient("HTTP 429")),
            Ok("{\"ok\":true}".into()),
        ]);
        let started = Instant::now();
        let out = invoker(backend.clone())
            .invoke(&request(), in_secs(20), &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap();
        assert_eq!(out.attempts, 3);
        assert_eq!(backend.calls(), 3);
        // 1 s + 2 s of backoff without jitter.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn four_transient_failures_exhaust_retries() {
        let backend = Scripted::new(vec![Err(BackendError::transient("HTTP 503")); 4]);
        let err = invoker(backend.clone())
            .invoke(&request(), in_secs(20), &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            InvocationFailure::ServiceUnavailable {
                attempts: 4,
                retries: 3,
                last_error: "HTTP 503".into()
            }
        );
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let backend = Scripted::new(vec![
            Err(BackendError::permanent("401 invalid api key")),
            Ok("{}".into()),
        ]);
        let err = invoker(backend.clone())
            .invoke(&request(), in_secs(20), &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationFailure::Permanent { attempts: 1, .. }));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_that_would_cross_deadline_aborts_early() {
        // Failures at t=0 and t=1s; the 2 s backoff would end at t=3s > 2.5s.
        let backend = Scripted::new(vec![Err(BackendError::transient("HTTP 503")); 4]);
        let started = Instant::now();
        let deadline = started + Duration::from_millis(2500);
        let err = invoker(backend.clone())
            .invoke(&request(), deadline, &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationFailure::Timeout { attempts: 2, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert!(Instant::now() < deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_is_cut_off_at_the_deadline() {
        let backend = Scripted::slow(vec![Ok("{}".into())], Duration::from_secs(60));
        let started = Instant::now();
        let err = invoker(backend)
            .invoke(&request(), in_secs(5), &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationFailure::Timeout { attempts: 1, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_transient() {
        let backend = Scripted::slow(vec![Ok("{}".into()); 2], Duration::from_secs(3));
        let policy = RetryPolicy {
            jitter: false,
            ..Default::default()
        };
        let invoker = ModelInvoker::new(backend.clone(), policy, Duration::from_secs(2));
        // Each attempt is cut at 2 s: timeouts at 2, 5, 9 and 15 s with
        // backoffs of 1, 2 and 4 s in between, all well inside the deadline.
        let err = invoker
            .invoke(&request(), in_secs(60), &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap_err();
        match err {
            InvocationFailure::ServiceUnavailable {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 4);
                assert!(last_error.contains("timed out"), "got: {last_error}");
            }
            other => panic!("expected ServiceUnavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_starts_no_attempt() {
        let backend = Scripted::new(vec![Ok("{}".into())]);
        let (handle, signal) = crate::cancel::cancel_pair();
        handle.cancel();
        let err = invoker(backend.clone())
            .invoke(&request(), in_secs(20), &signal, &NoopProgressCallback)
            .await
            .unwrap_err();
        assert_eq!(err, InvocationFailure::Cancelled { attempts: 0 });
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_stops_retrying() {
        let backend = Scripted::new(vec![Err(BackendError::transient("HTTP 503")); 4]);
        let (handle, signal) = crate::cancel::cancel_pair();
        tokio::spawn(async move {
            sleep(Duration::from_millis(500)).await;
            handle.cancel();
        });
        let err = invoker(backend.clone())
            .invoke(&request(), in_secs(20), &signal, &NoopProgressCallback)
            .await
            .unwrap_err();
        assert_eq!(err, InvocationFailure::Cancelled { attempts: 1 });
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_starts_no_attempt() {
        let backend = Scripted::new(vec![Ok("{}".into())]);
        let err = invoker(backend.clone())
            .invoke(&request(), Instant::now(), &CancelSignal::never(), &NoopProgressCallback)
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationFailure::Timeout { attempts: 0, .. }));
        assert_eq!(backend.calls(), 0);
    }
}
