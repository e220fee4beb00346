//! Document encoding: validated upload bytes → the payload sent to the VLM.
//!
//! Images travel as base64 attachments on the user message. PDFs are first
//! rasterised (see [`crate::pipeline::render`]) and travel as a PNG of their
//! first page, since vision inputs accept image types only. PNG keeps text
//! edges crisp where JPEG artefacts would confuse the model.
//! `detail: "high"` asks GPT-4-class models for the full tile budget so
//! small print on the invoice (tax IDs, line totals) survives.
//! Plain-text documents are decoded and inlined into the prompt instead.
//!
//! Encoding consumes the document buffer; callers cannot keep a copy of the
//! bytes alive past this point by accident.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use tracing::debug;

/// Coarse document category derived from the MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    Pdf,
    Image,
    Text,
}

impl SourceFormat {
    /// Unknown MIME types are treated as text.
    pub fn from_mime(mime_type: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        if mime == "application/pdf" {
            SourceFormat::Pdf
        } else if mime.starts_with("image/") {
            SourceFormat::Image
        } else {
            SourceFormat::Text
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceFormat::Pdf => "pdf",
            SourceFormat::Image => "image",
            SourceFormat::Text => "text",
        })
    }
}

/// What the model actually receives for one document.
#[derive(Clone)]
pub enum DocumentPayload {
    /// Base64 image attachment: an uploaded image, or a rendered PDF page.
    Attachment {
        format: SourceFormat,
        image: ImageData,
    },
    /// Decoded document text.
    Text(String),
}

impl DocumentPayload {
    pub fn source_format(&self) -> SourceFormat {
        match self {
            DocumentPayload::Attachment { format, .. } => *format,
            DocumentPayload::Text(_) => SourceFormat::Text,
        }
    }
}

// Contents stay out of logs and panic messages.
impl fmt::Debug for DocumentPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentPayload::Attachment { format, image } => f
                .debug_struct("Attachment")
                .field("format", format)
                .field("mime_type", &image.mime_type)
                .field("base64_len", &image.data.len())
                .finish(),
            DocumentPayload::Text(text) => f
                .debug_struct("Text")
                .field("chars", &text.chars().count())
                .finish(),
        }
    }
}

/// Encode an uploaded image as-is.
pub fn encode_image(document: Vec<u8>, mime_type: &str) -> DocumentPayload {
    let b64 = STANDARD.encode(&document);
    debug!("Encoded {} byte image as {} base64 chars", document.len(), b64.len());
    DocumentPayload::Attachment {
        format: SourceFormat::Image,
        image: ImageData::new(b64, mime_type.trim()).with_detail("high"),
    }
}

/// Decode a text document for inlining into the prompt.
pub fn encode_text(document: Vec<u8>) -> DocumentPayload {
    debug!("Decoding {} byte text document", document.len());
    DocumentPayload::Text(decode_text(document))
}

/// Encode a rendered PDF page as a base64 PNG attachment.
pub fn encode_page(page: &DynamicImage) -> Result<DocumentPayload, image::ImageError> {
    let mut buf = Vec::new();
    page.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {}x{} page → {} bytes base64",
        page.width(),
        page.height(),
        b64.len()
    );
    Ok(DocumentPayload::Attachment {
        format: SourceFormat::Pdf,
        image: ImageData::new(b64, "image/png").with_detail("high"),
    })
}

/// UTF-8 first; anything else is read as Latin-1, which maps every byte.
fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => e.into_bytes().iter().map(|&b| char::from(b)).collect(),
    }
}
