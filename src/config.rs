//! Configuration types for invoice extraction.
//!
//! All extractor behaviour is controlled through [`ExtractionConfig`], built
//! via its [`ExtractionConfigBuilder`]. The config is fixed when an
//! [`crate::extract::InvoiceExtractor`] is built: thresholds, the critical
//! field set and the retry schedule never change per request.

use crate::error::ExtractError;
use crate::pipeline::confidence::ConfidencePolicy;
use crate::pipeline::llm::ExtractionBackend;
use crate::pipeline::render::{PdfRasterizer, DEFAULT_DPI};
use crate::pipeline::retry::RetryPolicy;
use crate::progress::ProgressCallback;
use crate::schema::MAX_LINE_ITEMS;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Configuration for an invoice extractor.
///
/// Built via [`ExtractionConfig::builder()`] or using
/// [`ExtractionConfig::default()`].
///
/// # Example
/// ```rust
/// use invoice_extract::ExtractionConfig;
/// use std::time::Duration;
///
/// let config = ExtractionConfig::builder()
///     .model("gpt-4o-mini")
///     .max_retries(2)
///     .budget(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// LLM model identifier, e.g. "gpt-4o". If None, uses [`DEFAULT_MODEL`].
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "gemini").
    /// If None along with `provider`, the provider is auto-detected.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed backend. Takes precedence over every provider setting.
    pub backend: Option<Arc<dyn ExtractionBackend>>,

    /// Sampling temperature. Default: 0.4.
    pub temperature: f32,

    /// Maximum tokens the model may generate. Default: 4096.
    ///
    /// A fully populated invoice with 50 line items runs to roughly 3 000
    /// output tokens.
    pub max_tokens: usize,

    /// Retry schedule for transient model failures.
    pub retry: RetryPolicy,

    /// Upper bound for a single model call in seconds. Default: 20.
    pub api_timeout_secs: u64,

    /// Default end-to-end wall-clock budget per request. Default: 20 s.
    pub budget: Duration,

    /// Custom system prompt. If None, uses
    /// [`crate::prompts::EXTRACTION_SYSTEM_PROMPT`].
    pub system_prompt: Option<String>,

    /// Accept / warn / reject thresholds and the critical field set.
    pub confidence: ConfidencePolicy,

    /// Line items kept per document. Default: 50.
    pub max_line_items: usize,

    /// Resolution PDFs are rendered at before the size cap. Default: 150.
    pub pdf_dpi: u32,

    /// Explicit PDFium shared library. If None, `PDFIUM_LIB_PATH`, the
    /// working directory and the system search path are tried in turn.
    pub pdfium_library_path: Option<PathBuf>,

    /// Pre-constructed rasteriser. Takes precedence over the PDFium settings.
    pub pdf_rasterizer: Option<Arc<dyn PdfRasterizer>>,

    /// Optional stage / retry / finish observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            backend: None,
            temperature: 0.4,
            max_tokens: 4096,
            retry: RetryPolicy::default(),
            api_timeout_secs: 20,
            budget: Duration::from_secs(20),
            system_prompt: None,
            confidence: ConfidencePolicy::default(),
            max_line_items: MAX_LINE_ITEMS,
            pdf_dpi: DEFAULT_DPI,
            pdfium_library_path: None,
            pdf_rasterizer: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "backend",
                &self.backend.as_ref().map(|b| b.model_version().to_string()),
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("retry", &self.retry)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("budget", &self.budget)
            .field("system_prompt", &self.system_prompt.as_ref().map(|p| p.len()))
            .field("confidence", &self.confidence)
            .field("max_line_items", &self.max_line_items)
            .field("pdf_dpi", &self.pdf_dpi)
            .field("pdfium_library_path", &self.pdfium_library_path)
            .field(
                "pdf_rasterizer",
                &self.pdf_rasterizer.as_ref().map(|_| "<dyn PdfRasterizer>"),
            )
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ExtractionProgressCallback>"),
            )
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Model name with the default applied.
    pub fn model_or_default(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Builder for [`ExtractionConfig`].
#[derive(Debug)]
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl ExtractionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ExtractionBackend>) -> Self {
        self.config.backend = Some(backend);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.retry.max_retries = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.retry.initial_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.retry.backoff_factor = factor;
        self
    }

    pub fn jitter(mut self, v: bool) -> Self {
        self.config.retry.jitter = v;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn budget(mut self, budget: Duration) -> Self {
        self.config.budget = budget;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn confidence_policy(mut self, policy: ConfidencePolicy) -> Self {
        self.config.confidence = policy;
        self
    }

    pub fn reject_below(mut self, t: f64) -> Self {
        self.config.confidence.reject_below = t;
        self
    }

    pub fn warn_below(mut self, t: f64) -> Self {
        self.config.confidence.warn_below = t;
        self
    }

    pub fn critical_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.confidence.critical_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn max_line_items(mut self, n: usize) -> Self {
        self.config.max_line_items = n;
        self
    }

    pub fn pdf_dpi(mut self, dpi: u32) -> Self {
        self.config.pdf_dpi = dpi;
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn pdf_rasterizer(mut self, rasterizer: Arc<dyn PdfRasterizer>) -> Self {
        self.config.pdf_rasterizer = Some(rasterizer);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ExtractError> {
        let c = &self.config;
        c.confidence.validate().map_err(ExtractError::InvalidConfig)?;
        if c.budget.is_zero() {
            return Err(ExtractError::InvalidConfig(
                "Budget must be greater than zero".into(),
            ));
        }
        if c.api_timeout_secs == 0 {
            return Err(ExtractError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.retry.backoff_factor.is_nan() || c.retry.backoff_factor < 1.0 {
            return Err(ExtractError::InvalidConfig(format!(
                "Backoff factor must be ≥ 1.0, got {}",
                c.retry.backoff_factor
            )));
        }
        if c.max_line_items == 0 {
            return Err(ExtractError::InvalidConfig(
                "max_line_items must be ≥ 1".into(),
            ));
        }
        if !(36..=600).contains(&c.pdf_dpi) {
            return Err(ExtractError::InvalidConfig(format!(
                "PDF DPI must be within 36–600, got {}",
                c.pdf_dpi
            )));
        }
        if c.max_tokens == 0 {
            return Err(ExtractError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_service_settings() {
        let c = ExtractionConfig::default();
        assert_eq!(c.model_or_default(), "gpt-4o");
        assert_eq!(c.temperature, 0.4);
        assert_eq!(c.max_tokens, 4096);
        assert_eq!(c.retry.max_retries, 3);
        assert_eq!(c.budget, Duration::from_secs(20));
        assert_eq!(c.api_timeout(), Duration::from_secs(20));
        assert_eq!(c.max_line_items, 50);
        assert_eq!(c.confidence.reject_below, 0.5);
        assert_eq!(c.confidence.warn_below, 0.9);
        assert_eq!(c.pdf_dpi, 150);
        assert!(c.pdf_rasterizer.is_none());
    }

    #[test]
    fn unbounded_budget_and_timeout_are_accepted() {
        let c = ExtractionConfig::builder()
            .budget(Duration::MAX)
            .api_timeout_secs(u64::MAX)
            .initial_delay(Duration::MAX)
            .build()
            .unwrap();
        assert_eq!(c.api_timeout(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn pdf_dpi_out_of_range_is_rejected() {
        assert!(ExtractionConfig::builder().pdf_dpi(10).build().is_err());
        assert!(ExtractionConfig::builder().pdf_dpi(2400).build().is_err());
        assert!(ExtractionConfig::builder().pdf_dpi(300).build().is_ok());
    }

    #[test]
    fn builder_sets_fields() {
        let c = ExtractionConfig::builder()
            .model("gpt-4o-mini")
            .provider_name("openai")
            .max_retries(1)
            .initial_delay(Duration::from_millis(100))
            .jitter(false)
            .budget(Duration::from_secs(5))
            .critical_fields(["supplier.name", "invoice.total"])
            .build()
            .unwrap();
        assert_eq!(c.model_or_default(), "gpt-4o-mini");
        assert_eq!(c.provider_name.as_deref(), Some("openai"));
        assert_eq!(c.retry.max_retries, 1);
        assert!(!c.retry.jitter);
        assert_eq!(c.confidence.critical_fields.len(), 2);
    }

    #[test]
    fn temperature_is_clamped() {
        let c = ExtractionConfig::builder().temperature(9.0).build().unwrap();
        assert_eq!(c.temperature, 2.0);
    }

    #[test]
    fn invalid_thresholds_are_rejected() {
        let err = ExtractionConfig::builder()
            .reject_below(0.95)
            .warn_below(0.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, ExtractError::InvalidConfig(_)));

        assert!(ExtractionConfig::builder().warn_below(1.5).build().is_err());
    }

    #[test]
    fn empty_critical_set_is_rejected() {
        let empty: [&str; 0] = [];
        assert!(ExtractionConfig::builder()
            .critical_fields(empty)
            .build()
            .is_err());
    }

    #[test]
    fn zero_budget_and_bad_backoff_are_rejected() {
        assert!(ExtractionConfig::builder()
            .budget(Duration::ZERO)
            .build()
            .is_err());
        assert!(ExtractionConfig::builder()
            .backoff_factor(0.5)
            .build()
            .is_err());
        assert!(ExtractionConfig::builder()
            .backoff_factor(f64::NAN)
            .build()
            .is_err());
    }

    #[test]
    fn debug_hides_provider_and_prompt_text() {
        let c = ExtractionConfig::builder()
            .system_prompt("secret prompt")
            .build()
            .unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("secret"), "got: {dbg}");
    }
}
