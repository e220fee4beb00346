//! Upload validation: the gate a document passes before it reaches the
//! pipeline.
//!
//! Three checks, in order: size (non-empty, at most [`MAX_DOCUMENT_BYTES`]),
//! type (content sniffed from magic bytes, never trusted from the file name),
//! and spoofing (a specific detected type must agree with the declared one).
//!
//! When the content is ambiguous (plain text has no signature) the declared
//! MIME type decides, and it must be on [`ALLOWED_MIME_TYPES`].

use crate::outcome::{PipelineFailure, PipelineOutcome};
use image::ImageFormat;
use serde_json::json;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// 5 MiB.
pub const MAX_DOCUMENT_BYTES: usize = 5 * 1024 * 1024;

pub const ALLOWED_MIME_TYPES: [&str; 11] = [
    "application/pdf",
    "text/plain",
    "text/markdown",
    "image/jpeg",
    "image/png",
    "image/tiff",
    "image/bmp",
    "image/webp",
    "image/heic",
    "image/heif",
    "image/gif",
];

fn mib(bytes: &usize) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0)
}

/// Why an upload was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Uploaded file is empty (0 bytes). Please upload a valid invoice document.")]
    Empty,

    #[error(
        "File size ({:.2} MB) exceeds the maximum allowed size of 5 MB. Please compress or split the document.",
        mib(.size_bytes)
    )]
    TooLarge { size_bytes: usize },

    #[error(
        "Unsupported file type '{detected}'. Supported formats: PDF, JPEG, PNG, TIFF, BMP, WebP, HEIC, HEIF, GIF, plain text, markdown."
    )]
    Unsupported { detected: String },

    #[error(
        "MIME type mismatch: declared '{declared}' but content is '{detected}'. This may indicate file extension spoofing."
    )]
    Mismatch { declared: String, detected: String },

    #[error("Cannot read {path:?}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
}

impl ValidationError {
    /// The `VALIDATION_FAILED` outcome reported for this error.
    pub fn into_outcome(self) -> PipelineOutcome {
        let details = match &self {
            ValidationError::Empty => json!({ "reason": "empty" }),
            ValidationError::TooLarge { size_bytes } => json!({
                "reason": "too_large",
                "size_bytes": size_bytes,
                "max_bytes": MAX_DOCUMENT_BYTES,
            }),
            ValidationError::Unsupported { detected } => json!({
                "reason": "unsupported_type",
                "detected": detected,
                "allowed": ALLOWED_MIME_TYPES,
            }),
            ValidationError::Mismatch { declared, detected } => json!({
                "reason": "mime_mismatch",
                "declared": declared,
                "detected": detected,
            }),
            ValidationError::Unreadable { .. } => json!({ "reason": "unreadable" }),
        };
        PipelineFailure::validation(self.to_string(), details).into()
    }
}

/// A document that passed validation, with the MIME type the pipeline
/// should use.
#[derive(Clone, PartialEq)]
pub struct ValidatedDocument {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl std::fmt::Debug for ValidatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedDocument")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// Outcome of content sniffing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sniffed {
    /// The content carries a recognisable signature.
    Specific(String),
    /// Looks like text; the declared type decides between text flavours.
    Text,
    /// No signature and not text.
    Unknown,
}

pub fn sniff_mime(bytes: &[u8]) -> Sniffed {
    if bytes.starts_with(b"%PDF") {
        return Sniffed::Specific("application/pdf".into());
    }
    if let Some(mime) = sniff_heif(bytes) {
        return Sniffed::Specific(mime.into());
    }
    if let Ok(format) = image::guess_format(bytes) {
        return Sniffed::Specific(image_mime(format));
    }
    if !bytes.contains(&0) && std::str::from_utf8(bytes).is_ok() {
        return Sniffed::Text;
    }
    Sniffed::Unknown
}

fn image_mime(format: ImageFormat) -> String {
    match format {
        ImageFormat::Png => "image/png".into(),
        ImageFormat::Jpeg => "image/jpeg".into(),
        ImageFormat::Gif => "image/gif".into(),
        ImageFormat::WebP => "image/webp".into(),
        ImageFormat::Tiff => "image/tiff".into(),
        ImageFormat::Bmp => "image/bmp".into(),
        other => other.to_mime_type().to_string(),
    }
}

/// ISO-BMFF `ftyp` box with a HEIF-family brand.
fn sniff_heif(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return None;
    }
    match &bytes[8..12] {
        b"heic" | b"heix" | b"heim" | b"heis" | b"hevc" | b"hevx" => Some("image/heic"),
        b"mif1" | b"msf1" | b"heif" => Some("image/heif"),
        _ => None,
    }
}

fn is_allowed(mime: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&mime)
}

/// Validate raw upload bytes against the declared MIME type (if any).
pub fn validate_upload(bytes: Vec<u8>, declared: Option<&str>) -> Result<ValidatedDocument, ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::Empty);
    }
    if bytes.len() > MAX_DOCUMENT_BYTES {
        return Err(ValidationError::TooLarge {
            size_bytes: bytes.len(),
        });
    }

    let declared = declared
        .map(|d| {
            // Drop parameters such as "; charset=utf-8".
            d.split(';').next().unwrap_or(d).trim().to_ascii_lowercase()
        })
        .filter(|d| !d.is_empty());

    let mime_type = match sniff_mime(&bytes) {
        Sniffed::Specific(detected) => {
            if !is_allowed(&detected) {
                return Err(ValidationError::Unsupported { detected });
            }
            if let Some(declared) = declared.filter(|d| is_allowed(d)) {
                if declared != detected {
                    return Err(ValidationError::Mismatch { declared, detected });
                }
            }
            detected
        }
        Sniffed::Text => match declared {
            Some(d) if is_allowed(&d) => d,
            Some(d) => return Err(ValidationError::Unsupported { detected: d }),
            None => "text/plain".to_string(),
        },
        Sniffed::Unknown => match declared {
            Some(d) if is_allowed(&d) => d,
            Some(d) => return Err(ValidationError::Unsupported { detected: d }),
            None => {
                return Err(ValidationError::Unsupported {
                    detected: "application/octet-stream".into(),
                })
            }
        },
    };

    debug!("Validated {} byte upload as {}", bytes.len(), mime_type);
    Ok(ValidatedDocument { bytes, mime_type })
}

/// Read a file from disk and validate it.
///
/// The size limit is checked against file metadata before the contents are
/// read.
pub async fn load_document(path: &Path, declared: Option<&str>) -> Result<ValidatedDocument, ValidationError> {
    let unreadable = |reason: String| ValidationError::Unreadable {
        path: path.to_path_buf(),
        reason,
    };

    let meta = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => unreadable("file not found".into()),
        std::io::ErrorKind::PermissionDenied => unreadable("permission denied".into()),
        _ => unreadable(e.to_string()),
    })?;
    if !meta.is_file() {
        return Err(unreadable("not a regular file".into()));
    }
    let size = usize::try_from(meta.len()).unwrap_or(usize::MAX);
    if size > MAX_DOCUMENT_BYTES {
        return Err(ValidationError::TooLarge { size_bytes: size });
    }

    let bytes = tokio::fs::read(path).await.map_err(|e| unreadable(e.to_string()))?;
    let declared = declared.map(str::to_string).or_else(|| mime_from_extension(path).map(str::to_string));
    validate_upload(bytes, declared.as_deref())
}

/// MIME type implied by a file extension, used as the declared type when the
/// caller gives none.
pub fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" | "text" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "gif" => "image/gif",
        _ => return None,
    })
}
