//! Pipeline stages for invoice extraction.
//!
//! Each submodule implements exactly one step of a request, so each can be
//! tested on its own and the orchestrator in [`crate::extract`] stays a thin
//! sequencer.
//!
//! ## Data Flow
//!
//! ```text
//! render ──▶ encode ──▶ llm ──▶ normalize ──▶ confidence
//! (PDF only) (base64)  (VLM)   (schema)      (verdict)
//!                        ▲
//!                      retry
//! ```
//!
//! 0. [`render`]     — rasterise the first page of a PDF via pdfium
//! 1. [`encode`]     — turn validated upload bytes or a rendered page into a
//!    base64 attachment, or decode text
//! 2. [`llm`]        — drive the model call with retry, backoff, per-attempt
//!    timeout, deadline and cancellation; the only stage with network I/O
//! 3. [`retry`]      — the pure backoff decision the invoker consults after a
//!    transient failure
//! 4. [`normalize`]  — map the model's JSON onto the canonical schema
//! 5. [`confidence`] — accept / warn / reject on per-field confidence

pub mod confidence;
pub mod encode;
pub mod llm;
pub mod normalize;
pub mod render;
pub mod retry;
