//! The single value handed back across the pipeline boundary.
//!
//! ## Wire shape
//!
//! ```text
//! success: { supplier, customer, invoice, line_items,
//!            meta: { model_version, processing_time_ms, overall_confidence,
//!                    warning, warning_fields, source_format, attempts } }
//! failure: { code, message, details, processing_time_ms }
//! ```
//!
//! Every failure carries a machine-readable `code` and a human-readable
//! `message`. A failed request never carries a partial document.

use crate::error::{InvocationFailure, NormalizationError, RenderError};
use crate::pipeline::confidence::ConfidenceVerdict;
use crate::pipeline::encode::SourceFormat;
use crate::schema::ExtractedDocument;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Rejected by upload validation before the pipeline ran.
    ValidationFailed,
    /// A critical field was missing or below the reject threshold.
    ConfidenceTooLow,
    /// The request deadline was reached.
    ProcessingTimeout,
    /// Retries exhausted, or the model rejected the request outright.
    ServiceUnavailable,
    /// The model answered with something that is not the expected JSON.
    MalformedOutput,
    /// The caller cancelled the request.
    #[serde(rename = "REQUEST_CANCELLED")]
    Cancelled,
}

impl FailureKind {
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::ValidationFailed => "VALIDATION_FAILED",
            FailureKind::ConfidenceTooLow => "CONFIDENCE_TOO_LOW",
            FailureKind::ProcessingTimeout => "PROCESSING_TIMEOUT",
            FailureKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            FailureKind::MalformedOutput => "MALFORMED_OUTPUT",
            FailureKind::Cancelled => "REQUEST_CANCELLED",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Metadata stamped on every successful extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMeta {
    pub model_version: String,
    pub processing_time_ms: u64,
    /// Minimum confidence across the critical fields.
    pub overall_confidence: f64,
    /// `null` when every present field cleared the warn threshold.
    pub warning: Option<String>,
    #[serde(default)]
    pub warning_fields: Vec<String>,
    pub source_format: SourceFormat,
    /// Model calls made, the successful one included.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSuccess {
    #[serde(flatten)]
    pub document: ExtractedDocument,
    pub meta: ExtractionMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFailure {
    #[serde(rename = "code")]
    pub kind: FailureKind,
    pub message: String,
    pub details: Value,
    pub processing_time_ms: u64,
}

impl PipelineFailure {
    fn new(kind: FailureKind, message: impl Into<String>, details: Value) -> Self {
        Self {
            kind,
            message: message.into(),
            details,
            processing_time_ms: 0,
        }
    }

    /// Upload validation rejected the document.
    pub fn validation(message: impl Into<String>, details: Value) -> Self {
        Self::new(FailureKind::ValidationFailed, message, details)
    }

    /// Map an invocation failure. `budget` is the wall-clock budget the
    /// request was given.
    pub fn from_invocation(failure: &InvocationFailure, budget: Duration) -> Self {
        match failure {
            InvocationFailure::ServiceUnavailable {
                attempts,
                retries,
                last_error,
            } => Self::new(
                FailureKind::ServiceUnavailable,
                "The extraction service is temporarily unavailable. Please try again in a moment.",
                json!({
                    "retry_attempts": retries,
                    "attempts": attempts,
                    "permanent": false,
                    "last_error": last_error,
                }),
            ),
            InvocationFailure::Permanent { attempts, message } => Self::new(
                FailureKind::ServiceUnavailable,
                "The extraction model rejected the request.",
                json!({
                    "retry_attempts": 0,
                    "attempts": attempts,
                    "permanent": true,
                    "last_error": message,
                }),
            ),
            InvocationFailure::Timeout { attempts, .. } => Self::new(
                FailureKind::ProcessingTimeout,
                format!(
                    "Processing exceeded the {}s limit. Try again with a smaller or clearer file.",
                    budget.as_secs_f64()
                ),
                json!({
                    "budget_ms": budget.as_millis() as u64,
                    "attempts": attempts,
                }),
            ),
            InvocationFailure::Cancelled { attempts } => Self::new(
                FailureKind::Cancelled,
                "The request was cancelled before it completed.",
                json!({ "attempts": attempts }),
            ),
        }
    }

    /// A PDF that cannot be rendered is a validation failure; a renderer
    /// that cannot run is a service failure.
    pub fn from_render(error: &RenderError) -> Self {
        if error.is_document_fault() {
            Self::new(
                FailureKind::ValidationFailed,
                "The PDF could not be rendered. Upload an unencrypted, non-empty PDF.",
                json!({ "reason": error.reason(), "detail": error.to_string() }),
            )
        } else {
            Self::new(
                FailureKind::ServiceUnavailable,
                "The PDF renderer is unavailable.",
                json!({
                    "retry_attempts": 0,
                    "attempts": 0,
                    "permanent": true,
                    "reason": error.reason(),
                    "last_error": error.to_string(),
                }),
            )
        }
    }

    pub fn from_normalization(error: &NormalizationError) -> Self {
        Self::new(
            FailureKind::MalformedOutput,
            "The extraction model returned output that could not be read as invoice data.",
            json!({ "reason": error.to_string() }),
        )
    }

    /// Returns `None` unless the verdict is a rejection.
    pub fn from_verdict(verdict: &ConfidenceVerdict) -> Option<Self> {
        let ConfidenceVerdict::Rejected {
            failed_fields,
            scores,
        } = verdict
        else {
            return None;
        };
        Some(Self::low_confidence(failed_fields, scores))
    }

    fn low_confidence(failed_fields: &[String], scores: &BTreeMap<String, f64>) -> Self {
        Self::new(
            FailureKind::ConfidenceTooLow,
            format!(
                "Invoice quality insufficient: {} too low for reliable processing.",
                failed_fields.join(", ")
            ),
            json!({
                "failed_fields": failed_fields,
                "confidence_scores": scores,
            }),
        )
    }
}

/// Exactly one of these is produced per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineOutcome {
    Success(ExtractionSuccess),
    Failure(PipelineFailure),
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Success(_))
    }

    /// Failure code, `None` on success.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            PipelineOutcome::Success(_) => None,
            PipelineOutcome::Failure(f) => Some(f.kind.code()),
        }
    }

    pub fn processing_time_ms(&self) -> u64 {
        match self {
            PipelineOutcome::Success(s) => s.meta.processing_time_ms,
            PipelineOutcome::Failure(f) => f.processing_time_ms,
        }
    }

    pub(crate) fn stamp(&mut self, processing_time_ms: u64) {
        match self {
            PipelineOutcome::Success(s) => s.meta.processing_time_ms = processing_time_ms,
            PipelineOutcome::Failure(f) => f.processing_time_ms = processing_time_ms,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| json!({ "error": e.to_string() }))
    }
}

impl From<PipelineFailure> for PipelineOutcome {
    fn from(f: PipelineFailure) -> Self {
        PipelineOutcome::Failure(f)
    }
}
