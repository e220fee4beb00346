//! Accept / warn / reject policy over per-field confidence scores.
//!
//! The evaluator is a pure function of the document and the
//! [`ConfidencePolicy`] it was built with: no I/O, no randomness, no state.
//! Evaluating the same document twice yields the same verdict.
//!
//! ## Rules
//!
//! 1. A critical field that is absent or below `reject_below` fails.
//! 2. Any failure rejects the document; warnings are not computed.
//! 3. Otherwise every *present* field below `warn_below` is a warning.
//!    Absent optional fields are never warnings.
//!
//! Both thresholds are strict: a score exactly at `reject_below` passes and a
//! score exactly at `warn_below` does not warn.

use crate::schema::ExtractedDocument;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Field paths whose low confidence rejects a document outright.
pub const DEFAULT_CRITICAL_FIELDS: [&str; 6] = [
    "supplier.name",
    "customer.name",
    "invoice.number",
    "invoice.issue_date",
    "invoice.due_date",
    "invoice.total",
];

/// Thresholds and the critical-field set, fixed when the extractor is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidencePolicy {
    /// Critical fields strictly below this are rejected. Default: 0.50.
    pub reject_below: f64,
    /// Present fields strictly below this produce a warning. Default: 0.90.
    pub warn_below: f64,
    /// Dotted field paths (see [`ExtractedDocument::confidence_of`]).
    pub critical_fields: Vec<String>,
}

impl Default for ConfidencePolicy {
    fn default() -> Self {
        Self {
            reject_below: 0.50,
            warn_below: 0.90,
            critical_fields: DEFAULT_CRITICAL_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ConfidencePolicy {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.critical_fields.is_empty() {
            return Err("critical field set must not be empty".into());
        }
        for t in [self.reject_below, self.warn_below] {
            if !(0.0..=1.0).contains(&t) {
                return Err(format!("confidence thresholds must be within 0.0–1.0, got {t}"));
            }
        }
        if self.reject_below > self.warn_below {
            return Err(format!(
                "reject threshold ({}) must not exceed warn threshold ({})",
                self.reject_below, self.warn_below
            ));
        }
        Ok(())
    }
}

/// The accept / warn / reject decision for one document.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfidenceVerdict {
    Accepted {
        overall_confidence: f64,
    },
    AcceptedWithWarning {
        message: String,
        fields: Vec<String>,
        overall_confidence: f64,
    },
    Rejected {
        failed_fields: Vec<String>,
        /// Score of every critical field; `0.0` for missing ones.
        scores: BTreeMap<String, f64>,
    },
}

impl ConfidenceVerdict {
    /// Minimum confidence across critical fields (`0.0` once rejected for a
    /// missing field).
    pub fn overall_confidence(&self) -> f64 {
        match self {
            Self::Accepted { overall_confidence }
            | Self::AcceptedWithWarning {
                overall_confidence, ..
            } => *overall_confidence,
            Self::Rejected { scores, .. } => min_score(scores.values().copied()),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Applies a [`ConfidencePolicy`] to extracted documents.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceEvaluator {
    policy: ConfidencePolicy,
}

impl ConfidenceEvaluator {
    pub fn new(policy: ConfidencePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ConfidencePolicy {
        &self.policy
    }

    pub fn evaluate(&self, document: &ExtractedDocument) -> ConfidenceVerdict {
        let mut failed_fields = Vec::new();
        let mut scores = BTreeMap::new();

        for path in &self.policy.critical_fields {
            match document.confidence_of(path) {
                Some(c) => {
                    if c < self.policy.reject_below {
                        failed_fields.push(path.clone());
                    }
                    scores.insert(path.clone(), c);
                }
                None => {
                    failed_fields.push(path.clone());
                    scores.insert(path.clone(), 0.0);
                }
            }
        }

        if !failed_fields.is_empty() {
            warn!(
                "Rejected: {} critical field(s) below {:.2}: {}",
                failed_fields.len(),
                self.policy.reject_below,
                failed_fields.join(", ")
            );
            return ConfidenceVerdict::Rejected {
                failed_fields,
                scores,
            };
        }

        let overall_confidence = min_score(scores.values().copied());

        let low: Vec<(String, f64)> = document
            .present_fields()
            .into_iter()
            .filter(|(_, c)| *c < self.policy.warn_below)
            .collect();

        if low.is_empty() {
            debug!("Accepted with overall confidence {:.2}", overall_confidence);
            return ConfidenceVerdict::Accepted { overall_confidence };
        }

        let listed: Vec<String> = low.iter().map(|(p, c)| format!("{p} ({c:.2})")).collect();
        let message = format!(
            "{} field(s) have moderate confidence and may need manual review: {}",
            low.len(),
            listed.join(", ")
        );
        debug!("Accepted with {} warning(s)", low.len());

        ConfidenceVerdict::AcceptedWithWarning {
            message,
            fields: low.into_iter().map(|(p, _)| p).collect(),
            overall_confidence,
        }
    }
}

fn min_score(scores: impl Iterator<Item = f64>) -> f64 {
    scores.fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.min(c))))
        .unwrap_or(0.0)
}
