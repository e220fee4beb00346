//! PDF rasterisation: first page → `DynamicImage` sized for vision models.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and
//! keeps thread-local state. Rendering runs on Tokio's blocking pool so the
//! async workers never stall on it.
//!
//! ## Why only the first page?
//!
//! Invoice headers, parties and totals sit on page one for the overwhelming
//! majority of layouts, and a single image keeps the request inside the
//! latency budget.
//!
//! ## Size limits
//!
//! Pages render at 150 DPI and are then fitted inside 768 × 2000 px, the
//! largest image GPT-4o vision reads without further downscaling.

use crate::error::RenderError;
use image::{imageops::FilterType, DynamicImage};
use pdfium_render::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_DPI: u32 = 150;
pub const MAX_IMAGE_WIDTH: u32 = 768;
pub const MAX_IMAGE_HEIGHT: u32 = 2000;

/// PDF user-space units per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Turns PDF bytes into an image of the first page.
///
/// Implementations are called from a blocking thread.
pub trait PdfRasterizer: Send + Sync {
    fn render_first_page(&self, pdf: &[u8]) -> Result<DynamicImage, RenderError>;
}

/// [`PdfRasterizer`] backed by a dynamically loaded PDFium library.
///
/// Library lookup order: the explicit path, then `PDFIUM_LIB_PATH`, then the
/// platform library name in the working directory, then the system library
/// search path.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
    library_path: Option<PathBuf>,
}

impl Default for PdfiumRasterizer {
    fn default() -> Self {
        Self::new(DEFAULT_DPI)
    }
}

impl PdfiumRasterizer {
    pub fn new(dpi: u32) -> Self {
        Self {
            dpi: dpi.max(1),
            library_path: None,
        }
    }

    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    fn bind(&self) -> Result<Pdfium, RenderError> {
        let explicit = self
            .library_path
            .clone()
            .or_else(|| std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from));

        let bindings = match explicit {
            Some(path) => Pdfium::bind_to_library(&path),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| RenderError::Unavailable(format!("{:?}", e)))?;

        Ok(Pdfium::new(bindings))
    }
}

impl PdfRasterizer for PdfiumRasterizer {
    fn render_first_page(&self, pdf: &[u8]) -> Result<DynamicImage, RenderError> {
        let pdfium = self.bind()?;

        let document = pdfium.load_pdf_from_byte_slice(pdf, None).map_err(|e| {
            let detail = format!("{:?}", e);
            if detail.contains("Password") || detail.contains("password") {
                RenderError::PasswordProtected
            } else {
                RenderError::Unreadable(detail)
            }
        })?;

        let pages = document.pages();
        if pages.len() == 0 {
            return Err(RenderError::NoPages);
        }
        info!("PDF loaded: {} pages, rendering page 1", pages.len());

        let page = pages
            .get(0)
            .map_err(|e| RenderError::Rasterisation(format!("{:?}", e)))?;

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(self.dpi as f32 / POINTS_PER_INCH)
            .set_maximum_width(MAX_IMAGE_WIDTH as i32)
            .set_maximum_height(MAX_IMAGE_HEIGHT as i32);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| RenderError::Rasterisation(format!("{:?}", e)))?;

        Ok(bitmap.as_image())
    }
}

/// Render the first page of `pdf` on the blocking pool and fit it inside
/// [`MAX_IMAGE_WIDTH`] × [`MAX_IMAGE_HEIGHT`].
///
/// The PDF bytes are dropped on the blocking thread once rendering ends.
pub async fn render_first_page(
    rasterizer: Arc<dyn PdfRasterizer>,
    pdf: Vec<u8>,
) -> Result<DynamicImage, RenderError> {
    let size = pdf.len();
    let image = tokio::task::spawn_blocking(move || rasterizer.render_first_page(&pdf))
        .await
        .map_err(|e| RenderError::Internal(format!("Render task failed: {}", e)))??;

    debug!(
        "Rendered {} byte PDF → {}x{} px",
        size,
        image.width(),
        image.height()
    );
    Ok(fit_within(image, MAX_IMAGE_WIDTH, MAX_IMAGE_HEIGHT))
}

/// Downscale `image` to fit `max_width` × `max_height`, keeping its aspect
/// ratio. Images already inside the box are returned untouched.
pub fn fit_within(image: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if image.width() <= max_width && image.height() <= max_height {
        return image;
    }
    let resized = image.resize(max_width, max_height, FilterType::Triangle);
    info!(
        "Resized page {}x{} → {}x{} to fit {}x{}",
        image.width(),
        image.height(),
        resized.width(),
        resized.height(),
        max_width,
        max_height
    );
    resized
}
