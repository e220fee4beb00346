//! # invoice-extract
//!
//! Extract structured invoice data (supplier, customer, totals, line items)
//! from PDFs, images and text using Vision Language Models, and decide under
//! a hard wall-clock budget whether the result is trustworthy enough to
//! return.
//!
//! ## Why this crate?
//!
//! Invoice layouts are unbounded; template-based extractors break on every
//! new supplier. This crate lets a VLM read the document as a human would,
//! asks it for a per-field confidence score, and applies a deterministic
//! accept / warn / reject policy on top so callers never receive a
//! low-quality extraction silently.
//!
//! ## Pipeline Overview
//!
//! ```text
//! bytes + MIME type
//!  │
//!  ├─ 1. Validate   size / allow-list / magic bytes      (upload)
//!  ├─ 2. Encode     PDF page → PNG, base64 attachment,   (pipeline::render,
//!  │                or decoded text                      pipeline::encode)
//!  ├─ 3. Invoke     VLM call with retry, backoff, deadline (pipeline::llm)
//!  ├─ 4. Normalize  model JSON → canonical schema        (pipeline::normalize)
//!  ├─ 5. Evaluate   accept / warn / reject               (pipeline::confidence)
//!  └─ 6. Outcome    success payload or coded failure     (outcome)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use invoice_extract::{upload, ExtractionConfig, InvoiceExtractor, PipelineOutcome};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let extractor = InvoiceExtractor::from_config(&config).await?;
//!
//!     let doc = upload::load_document(Path::new("invoice.pdf"), None).await?;
//!     match extractor.run(doc.bytes, &doc.mime_type, config.budget).await {
//!         PipelineOutcome::Success(s) => println!("total: {:?}", s.document.invoice.total),
//!         PipelineOutcome::Failure(f) => eprintln!("{}: {}", f.kind, f.message),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `invoice-extract` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! invoice-extract = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cancel;
pub mod config;
pub mod error;
pub mod extract;
pub mod outcome;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;
pub mod upload;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use error::{ExtractError, InvocationFailure, NormalizationError, RenderError};
pub use extract::{extract, extract_sync, InvoiceExtractor};
pub use outcome::{ExtractionMeta, ExtractionSuccess, FailureKind, PipelineFailure, PipelineOutcome};
pub use pipeline::confidence::{ConfidenceEvaluator, ConfidencePolicy, ConfidenceVerdict};
pub use pipeline::llm::{
    BackendError, ErrorClass, ExtractionBackend, LlmBackend, ModelInvoker, ModelReply, ModelRequest,
    RawModelOutput,
};
pub use pipeline::normalize::ResponseNormalizer;
pub use pipeline::render::{PdfRasterizer, PdfiumRasterizer};
pub use pipeline::retry::{RetryDecision, RetryPolicy};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, PipelineStage, ProgressCallback};
pub use schema::{Customer, ExtractedDocument, FieldValue, InvoiceSummary, LineItem, Supplier};
