//! Error types for the invoice-extract library.
//!
//! Two distinct kinds of error reflect two distinct failure modes:
//!
//! * [`ExtractError`] — **Setup**: the extractor cannot be built at all
//!   (no provider configured, invalid configuration). Returned as
//!   `Err(ExtractError)` before any document is accepted.
//!
//! * Stage failures ([`RenderError`], [`InvocationFailure`],
//!   [`NormalizationError`]) — produced
//!   while a single request is running. They never escape
//!   [`crate::extract::InvoiceExtractor::run`]; the orchestrator folds them
//!   into a [`crate::outcome::PipelineOutcome::Failure`] value.

use thiserror::Error;

/// Fatal errors raised while configuring an extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why the model invocation sequence for one request ended without output.
///
/// Transient errors never appear here individually: they are absorbed by the
/// retry loop and only surface as [`InvocationFailure::ServiceUnavailable`]
/// once every retry has been spent.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvocationFailure {
    /// Every attempt failed with a transient error.
    #[error("Model unavailable after {attempts} attempts ({retries} retries): {last_error}")]
    ServiceUnavailable {
        attempts: u32,
        retries: u32,
        last_error: String,
    },

    /// The model rejected the request outright (auth, bad request, content policy).
    #[error("Model rejected the request: {message}")]
    Permanent { attempts: u32, message: String },

    /// The request deadline was reached during an attempt or would have been
    /// crossed by the next backoff sleep.
    #[error("Deadline exceeded after {elapsed_ms}ms and {attempts} attempts")]
    Timeout { elapsed_ms: u64, attempts: u32 },

    /// The caller went away; no further attempt was started.
    #[error("Request cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl InvocationFailure {
    /// Number of model calls that were actually started.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::ServiceUnavailable { attempts, .. }
            | Self::Permanent { attempts, .. }
            | Self::Timeout { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// The model answered, but not with the structured data we asked for.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("Model output is not valid JSON: {0}")]
    InvalidSyntax(String),

    #[error("Model output has the wrong shape: {0}")]
    WrongShape(String),
}

/// Why a PDF could not be turned into a page image.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    /// The PDFium library could not be loaded.
    #[error("PDF renderer unavailable: {0}")]
    Unavailable(String),

    #[error("PDF is password-protected")]
    PasswordProtected,

    #[error("PDF could not be opened: {0}")]
    Unreadable(String),

    #[error("PDF has no pages")]
    NoPages,

    #[error("Page rasterisation failed: {0}")]
    Rasterisation(String),

    /// The blocking render task panicked or was cancelled by the runtime.
    #[error("Internal render error: {0}")]
    Internal(String),
}

impl RenderError {
    /// The document itself is at fault, as opposed to the renderer.
    pub fn is_document_fault(&self) -> bool {
        matches!(
            self,
            RenderError::PasswordProtected
                | RenderError::Unreadable(_)
                | RenderError::NoPages
                | RenderError::Rasterisation(_)
        )
    }

    /// Stable machine-readable reason for outcome details.
    pub fn reason(&self) -> &'static str {
        match self {
            RenderError::Unavailable(_) => "pdf_renderer_unavailable",
            RenderError::PasswordProtected => "pdf_password_protected",
            RenderError::Unreadable(_) => "pdf_unreadable",
            RenderError::NoPages => "pdf_no_pages",
            RenderError::Rasterisation(_) => "pdf_rasterisation_failed",
            RenderError::Internal(_) => "pdf_render_internal",
        }
    }
}
