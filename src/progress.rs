//! Progress-callback trait for per-request pipeline events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to observe
//! stage transitions, retries and the terminal outcome of every request.
//!
//! Callers can forward events to a metrics sink, a log line or a request
//! trace without the library knowing how the host application reports them.
//!
//! # Example
//!
//! ```rust
//! use invoice_extract::{ExtractionConfig, ExtractionProgressCallback, PipelineStage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct RetryCounter {
//!     retries: AtomicUsize,
//! }
//!
//! impl ExtractionProgressCallback for RetryCounter {
//!     fn on_retry(&self, attempt: u32, delay: std::time::Duration, error: &str) {
//!         self.retries.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("attempt {attempt} failed ({error}); retrying in {delay:?}");
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(RetryCounter { retries: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::outcome::FailureKind;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Where a request currently is in the pipeline state machine.
///
/// Emitted in order: `Rendering` (PDFs only), `Invoking`, zero or more (`BackingOff`, `Invoking`)
/// pairs, then `Normalizing` and `Evaluating` on the happy path, and finally
/// exactly one terminal `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    /// Rasterising the first page of a PDF.
    Rendering,
    Invoking,
    BackingOff,
    Normalizing,
    Evaluating,
    Done,
    Failed(FailureKind),
}

impl PipelineStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed(_))
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Rendering => f.write_str("rendering"),
            PipelineStage::Invoking => f.write_str("invoking"),
            PipelineStage::BackingOff => f.write_str("backing-off"),
            PipelineStage::Normalizing => f.write_str("normalizing"),
            PipelineStage::Evaluating => f.write_str("evaluating"),
            PipelineStage::Done => f.write_str("done"),
            PipelineStage::Failed(kind) => write!(f, "failed({})", kind.code()),
        }
    }
}

/// Called by the pipeline as a request moves through its stages.
///
/// Implementations must be `Send + Sync`: one callback instance is shared by
/// every request an extractor serves, and requests may run concurrently.
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait ExtractionProgressCallback: Send + Sync {
    /// Called on every stage transition, including the terminal one.
    fn on_stage(&self, stage: PipelineStage) {
        let _ = stage;
    }

    /// Called when a transient failure is about to be retried.
    ///
    /// # Arguments
    /// * `attempt` — 1-indexed number of the attempt that just failed
    /// * `delay`   — backoff sleep before the next attempt
    /// * `error`   — human-readable description of the failure
    fn on_retry(&self, attempt: u32, delay: Duration, error: &str) {
        let _ = (attempt, delay, error);
    }

    /// Called once per request after the outcome is assembled.
    ///
    /// # Arguments
    /// * `code`       — failure code, or `None` on success
    /// * `elapsed_ms` — the `processing_time_ms` stamped on the outcome
    fn on_finish(&self, code: Option<&str>, elapsed_ms: u64) {
        let _ = (code, elapsed_ms);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;
