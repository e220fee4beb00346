//! Top-level extraction API.
//!
//! [`InvoiceExtractor`] sequences one request through the pipeline and turns
//! every exit path into a [`PipelineOutcome`]:
//!
//! ```text
//! render (PDF) ──▶ encode ──▶ invoke (retry / backoff) ──▶ normalize ──▶ evaluate ──▶ Done
//!      │                          │                            │             │
//!      ▼                          ▼                            ▼             ▼
//! VALIDATION_FAILED     SERVICE_UNAVAILABLE            MALFORMED_OUTPUT   CONFIDENCE_TOO_LOW
//!                       PROCESSING_TIMEOUT
//!                       REQUEST_CANCELLED
//! ```
//!
//! The extractor is built once and shared; it holds no per-request state, so
//! concurrent `run` calls on the same instance never interact.

use crate::cancel::CancelSignal;
use crate::config::ExtractionConfig;
use crate::error::{ExtractError, InvocationFailure, RenderError};
use crate::outcome::{ExtractionMeta, ExtractionSuccess, PipelineFailure, PipelineOutcome};
use crate::pipeline::confidence::{ConfidenceEvaluator, ConfidenceVerdict};
use crate::pipeline::encode::{encode_image, encode_page, encode_text, DocumentPayload, SourceFormat};
use crate::pipeline::llm::{deadline_after, ExtractionBackend, LlmBackend, ModelInvoker, ModelRequest};
use crate::pipeline::normalize::ResponseNormalizer;
use crate::pipeline::render::{render_first_page, PdfRasterizer, PdfiumRasterizer};
use crate::progress::{NoopProgressCallback, PipelineStage, ProgressCallback};
use crate::prompts::EXTRACTION_SYSTEM_PROMPT;
use edgequake_llm::{LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// The pipeline orchestrator: one instance serves any number of requests.
pub struct InvoiceExtractor {
    invoker: ModelInvoker,
    normalizer: ResponseNormalizer,
    evaluator: ConfidenceEvaluator,
    rasterizer: Arc<dyn PdfRasterizer>,
    system_prompt: String,
    budget: Duration,
    progress: ProgressCallback,
}

impl InvoiceExtractor {
    /// Build an extractor, resolving the model backend from `config`.
    ///
    /// This is the only place a missing provider or API key surfaces; once
    /// built, [`run`](Self::run) never returns an error.
    pub async fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractError> {
        let backend = resolve_backend(config).await?;
        Ok(Self::with_backend(config, backend))
    }

    /// Build an extractor over an explicit backend.
    pub fn with_backend(config: &ExtractionConfig, backend: Arc<dyn ExtractionBackend>) -> Self {
        Self {
            invoker: ModelInvoker::new(backend, config.retry.clone(), config.api_timeout()),
            normalizer: ResponseNormalizer::new(config.max_line_items),
            evaluator: ConfidenceEvaluator::new(config.confidence.clone()),
            rasterizer: resolve_rasterizer(config),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| EXTRACTION_SYSTEM_PROMPT.to_string()),
            budget: config.budget,
            progress: config
                .progress_callback
                .clone()
                .unwrap_or_else(|| Arc::new(NoopProgressCallback)),
        }
    }

    pub fn model_version(&self) -> &str {
        self.invoker.model_version()
    }

    /// Budget applied by [`extract`] and the CLI.
    pub fn default_budget(&self) -> Duration {
        self.budget
    }

    /// Run one document through the pipeline within `budget`.
    ///
    /// `document` must already have passed upload validation. It is consumed
    /// and released before this returns, whatever the outcome.
    pub async fn run(&self, document: Vec<u8>, mime_type: &str, budget: Duration) -> PipelineOutcome {
        self.run_with_cancel(document, mime_type, budget, &CancelSignal::never())
            .await
    }

    /// Like [`run`](Self::run), but stops at the next suspension point once
    /// `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        document: Vec<u8>,
        mime_type: &str,
        budget: Duration,
        cancel: &CancelSignal,
    ) -> PipelineOutcome {
        let start = Instant::now();
        info!(
            "Extracting {} byte {} document (budget {}ms)",
            document.len(),
            mime_type,
            budget.as_millis()
        );

        let mut outcome = self
            .execute(document, mime_type, deadline_after(start, budget), budget, cancel)
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        outcome.stamp(elapsed_ms);

        match &outcome {
            PipelineOutcome::Success(s) => {
                info!(
                    "Extraction succeeded in {}ms: {} line items, confidence {:.2}{}",
                    elapsed_ms,
                    s.document.line_items.len(),
                    s.meta.overall_confidence,
                    if s.meta.warning.is_some() { " (with warning)" } else { "" }
                );
                self.progress.on_stage(PipelineStage::Done);
            }
            PipelineOutcome::Failure(f) => {
                warn!("Extraction failed in {}ms: {}", elapsed_ms, f.kind);
                self.progress.on_stage(PipelineStage::Failed(f.kind));
            }
        }
        self.progress.on_finish(outcome.code(), elapsed_ms);
        outcome
    }

    async fn execute(
        &self,
        document: Vec<u8>,
        mime_type: &str,
        deadline: Instant,
        budget: Duration,
        cancel: &CancelSignal,
    ) -> PipelineOutcome {
        let source_format = SourceFormat::from_mime(mime_type);
        let payload = match source_format {
            SourceFormat::Pdf => match self.render_pdf(document, deadline, budget, cancel).await {
                Ok(payload) => payload,
                Err(failure) => return failure.into(),
            },
            SourceFormat::Image => encode_image(document, mime_type),
            SourceFormat::Text => encode_text(document),
        };
        let request = ModelRequest {
            system_prompt: self.system_prompt.clone(),
            payload,
        };

        let invoked = self
            .invoker
            .invoke(&request, deadline, cancel, self.progress.as_ref())
            .await;
        drop(request);
        let raw = match invoked {
            Ok(raw) => raw,
            Err(failure) => return PipelineFailure::from_invocation(&failure, budget).into(),
        };
        debug!(
            "Model answered after {} attempt(s) in {:?} ({} chars)",
            raw.attempts,
            raw.latency,
            raw.content.len()
        );

        self.progress.on_stage(PipelineStage::Normalizing);
        let document = match self.normalizer.normalize(&raw.content) {
            Ok(d) => d,
            Err(e) => {
                warn!("Normalization failed: {}", e);
                return PipelineFailure::from_normalization(&e).into();
            }
        };

        self.progress.on_stage(PipelineStage::Evaluating);
        let verdict = self.evaluator.evaluate(&document);
        if let Some(failure) = PipelineFailure::from_verdict(&verdict) {
            return failure.into();
        }
        let (overall_confidence, warning, warning_fields) = match verdict {
            ConfidenceVerdict::AcceptedWithWarning {
                message,
                fields,
                overall_confidence,
            } => (overall_confidence, Some(message), fields),
            other => (other.overall_confidence(), None, Vec::new()),
        };

        PipelineOutcome::Success(ExtractionSuccess {
            document,
            meta: ExtractionMeta {
                model_version: raw.model_version,
                processing_time_ms: 0,
                overall_confidence,
                warning,
                warning_fields,
                source_format,
                attempts: raw.attempts,
            },
        })
    }

    /// Rasterise the first page of `pdf` within the deadline and encode it.
    async fn render_pdf(
        &self,
        pdf: Vec<u8>,
        deadline: Instant,
        budget: Duration,
        cancel: &CancelSignal,
    ) -> Result<DocumentPayload, PipelineFailure> {
        self.progress.on_stage(PipelineStage::Rendering);

        let rendered = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Rendering abandoned on cancellation");
                let cancelled = InvocationFailure::Cancelled { attempts: 0 };
                return Err(PipelineFailure::from_invocation(&cancelled, budget));
            }
            r = timeout_at(deadline, render_first_page(Arc::clone(&self.rasterizer), pdf)) => r,
        };

        let page = match rendered {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                warn!("PDF rendering failed: {}", e);
                return Err(PipelineFailure::from_render(&e));
            }
            Err(_) => {
                warn!("PDF rendering cut off by the request deadline");
                let timeout = InvocationFailure::Timeout {
                    elapsed_ms: budget.as_millis() as u64,
                    attempts: 0,
                };
                return Err(PipelineFailure::from_invocation(&timeout, budget));
            }
        };

        encode_page(&page).map_err(|e| {
            warn!("Rendered page could not be encoded: {}", e);
            PipelineFailure::from_render(&RenderError::Rasterisation(e.to_string()))
        })
    }
}

/// Build an extractor from `config` and run one document with the configured
/// budget.
///
/// # Errors
/// Only provider resolution can fail; pipeline failures are returned as
/// [`PipelineOutcome::Failure`].
pub async fn extract(
    document: Vec<u8>,
    mime_type: &str,
    config: &ExtractionConfig,
) -> Result<PipelineOutcome, ExtractError> {
    let extractor = InvoiceExtractor::from_config(config).await?;
    Ok(extractor.run(document, mime_type, config.budget).await)
}

/// Blocking wrapper around [`extract`] for synchronous callers.
pub fn extract_sync(
    document: Vec<u8>,
    mime_type: &str,
    config: &ExtractionConfig,
) -> Result<PipelineOutcome, ExtractError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| ExtractError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(extract(document, mime_type, config))
}

// ── Internal helpers ─────────────────────────────────────────────────────

async fn resolve_backend(config: &ExtractionConfig) -> Result<Arc<dyn ExtractionBackend>, ExtractError> {
    if let Some(ref backend) = config.backend {
        return Ok(Arc::clone(backend));
    }
    let (provider, model) = resolve_provider(config)?;
    info!("Using model {}", model);
    Ok(Arc::new(LlmBackend::new(
        provider,
        model,
        config.temperature,
        config.max_tokens,
    )))
}

fn resolve_rasterizer(config: &ExtractionConfig) -> Arc<dyn PdfRasterizer> {
    if let Some(ref rasterizer) = config.pdf_rasterizer {
        return Arc::clone(rasterizer);
    }
    let mut pdfium = PdfiumRasterizer::new(config.pdf_dpi);
    if let Some(ref path) = config.pdfium_library_path {
        pdfium = pdfium.with_library_path(path.clone());
    }
    Arc::new(pdfium)
}

fn create_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, ExtractError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        ExtractError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. pre-built provider (`config.provider`)
/// 2. named provider + model (`config.provider_name`)
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set
/// 4. OpenAI, when `OPENAI_API_KEY` is set
/// 5. [`ProviderFactory::from_env`] auto-detection
///
/// Returns the provider and the model name reported in outcome metadata.
fn resolve_provider(config: &ExtractionConfig) -> Result<(Arc<dyn LLMProvider>, String), ExtractError> {
    let model = config.model_or_default().to_string();

    if let Some(ref provider) = config.provider {
        return Ok((Arc::clone(provider), model));
    }

    if let Some(ref name) = config.provider_name {
        return Ok((create_provider(name, &model)?, model));
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            let model = config.model.clone().unwrap_or(env_model);
            return Ok((create_provider(&prov, &model)?, model));
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return Ok((create_provider("openai", &model)?, model));
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| ExtractError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok((llm_provider, model))
}
