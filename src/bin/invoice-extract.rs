//! CLI binary for invoice-extract.
//!
//! A thin shim over the library crate: validates the input file, maps CLI
//! flags to `ExtractionConfig`, runs one extraction and prints the outcome
//! as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use invoice_extract::{
    cancel_pair, upload, ExtractionConfig, ExtractionProgressCallback, InvoiceExtractor,
    PipelineOutcome, PipelineStage, ProgressCallback,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback ────────────────────────────────────────────────────

/// Prints one stderr line per stage transition and retry.
struct CliProgressCallback;

impl ExtractionProgressCallback for CliProgressCallback {
    fn on_stage(&self, stage: PipelineStage) {
        match stage {
            PipelineStage::Done | PipelineStage::Failed(_) | PipelineStage::BackingOff => {}
            other => eprintln!("  {} {}", dim("·"), dim(&other.to_string())),
        }
    }

    fn on_retry(&self, attempt: u32, delay: Duration, error: &str) {
        eprintln!(
            "  {} attempt {} failed ({}); retrying in {:.1}s",
            yellow("!"),
            attempt,
            error,
            delay.as_secs_f64()
        );
    }

    fn on_finish(&self, code: Option<&str>, elapsed_ms: u64) {
        match code {
            None => eprintln!("{} extracted in {}ms", green("✔"), elapsed_ms),
            Some(code) => eprintln!("{} {} after {}ms", red("✘"), bold(code), elapsed_ms),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract an invoice (JSON on stdout)
  invoice-extract invoice.pdf

  # Write the outcome to a file
  invoice-extract scan.png -o scan.json

  # Use a specific model with a longer budget
  invoice-extract --provider openai --model gpt-4o --budget-secs 45 invoice.pdf

  # Stricter confidence policy
  invoice-extract --reject-below 0.7 --warn-below 0.95 invoice.pdf

EXIT STATUS:
  0  extraction accepted (possibly with a warning)
  1  extraction failed; stdout carries the failure code and details
  2  the extractor could not be configured (no provider, bad flags)

SUPPORTED INPUTS:
  PDF, JPEG, PNG, TIFF, BMP, WebP, HEIC, HEIF, GIF, plain text, markdown (≤ 5 MB)

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Provider used with EDGEQUAKE_MODEL when --provider is unset
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         PDFium shared library used to render PDFs
  RUST_LOG                Log filter (overrides --verbose / --quiet)
"#;

/// Extract structured invoice data using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "invoice-extract",
    version,
    about = "Extract structured invoice data from PDFs, images and text using Vision LLMs",
    long_about = "Extract supplier, customer, totals and line items from an invoice with a Vision \
Language Model, then accept, warn or reject the result based on per-field confidence scores. \
Supports OpenAI, Anthropic, Google Gemini, Azure OpenAI and any OpenAI-compatible endpoint.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Invoice file (PDF, image, or text).
    input: PathBuf,

    /// Declared MIME type. Defaults to the one implied by the file extension.
    #[arg(long)]
    mime_type: Option<String>,

    /// Write the JSON outcome to this file instead of stdout.
    #[arg(short, long, env = "INVOICE_OUTPUT")]
    output: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4o, gpt-4o-mini, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "EDGEQUAKE_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama, or any OpenAI-compatible URL."
    )]
    provider: Option<String>,

    /// End-to-end wall-clock budget in seconds.
    #[arg(long, env = "INVOICE_BUDGET_SECS", default_value_t = 20)]
    budget_secs: u64,

    /// Retries after a transient model failure.
    #[arg(long, env = "INVOICE_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Upper bound for a single model call in seconds.
    #[arg(long, env = "INVOICE_API_TIMEOUT", default_value_t = 20)]
    api_timeout: u64,

    /// Disable backoff jitter.
    #[arg(long)]
    no_jitter: bool,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "INVOICE_TEMPERATURE", default_value_t = 0.4)]
    temperature: f32,

    /// Max LLM output tokens.
    #[arg(long, env = "INVOICE_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// Critical fields below this confidence reject the document.
    #[arg(long, default_value_t = 0.5)]
    reject_below: f64,

    /// Present fields below this confidence produce a warning.
    #[arg(long, default_value_t = 0.9)]
    warn_below: f64,

    /// Resolution PDFs are rendered at before the 768×2000 px cap.
    #[arg(long, env = "INVOICE_PDF_DPI", default_value_t = 150)]
    pdf_dpi: u32,

    /// PDFium shared library. Defaults to PDFIUM_LIB_PATH, then ./, then the system path.
    #[arg(long)]
    pdfium_lib: Option<PathBuf>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "INVOICE_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Print compact single-line JSON.
    #[arg(long)]
    compact: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "INVOICE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and the JSON outcome.
    #[arg(short, long, env = "INVOICE_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match run(&cli).await {
        Ok(outcome) if outcome.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            eprintln!("{} {:#}", red("error:"), e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: &Cli) -> Result<PipelineOutcome> {
    let progress: Option<ProgressCallback> = if cli.quiet {
        None
    } else {
        Some(Arc::new(CliProgressCallback))
    };
    let config = build_config(cli, progress).await?;

    // Validation failures are outcomes too, so they are reported in the same
    // JSON shape as pipeline failures.
    let outcome = match upload::load_document(&cli.input, cli.mime_type.as_deref()).await {
        Err(e) => {
            if !cli.quiet {
                eprintln!("{} {}", red("✘"), e);
            }
            e.into_outcome()
        }
        Ok(doc) => {
            let extractor = InvoiceExtractor::from_config(&config)
                .await
                .context("Failed to initialise the extraction model")?;
            if !cli.quiet {
                eprintln!(
                    "{} {} ({}, {} bytes) with {}",
                    bold("Extracting"),
                    cli.input.display(),
                    doc.mime_type,
                    doc.bytes.len(),
                    extractor.model_version()
                );
            }

            let (handle, signal) = cancel_pair();
            let ctrl_c = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.cancel();
                }
            });
            let outcome = extractor
                .run_with_cancel(doc.bytes, &doc.mime_type, config.budget, &signal)
                .await;
            ctrl_c.abort();
            outcome
        }
    };

    write_outcome(cli, &outcome).await?;

    if !cli.quiet {
        if let PipelineOutcome::Success(ref s) = outcome {
            if let Some(ref warning) = s.meta.warning {
                eprintln!("{} {}", yellow("⚠"), warning);
            }
        }
    }
    Ok(outcome)
}

async fn write_outcome(cli: &Cli, outcome: &PipelineOutcome) -> Result<()> {
    let json = if cli.compact {
        serde_json::to_string(outcome)
    } else {
        serde_json::to_string_pretty(outcome)
    }
    .context("Failed to serialise outcome")?;

    if let Some(ref path) = cli.output {
        tokio::fs::write(path, format!("{json}\n"))
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !cli.quiet {
            eprintln!("   {} {}", dim("→"), bold(&path.display().to_string()));
        }
    } else {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{json}").context("Failed to write to stdout")?;
    }
    Ok(())
}

/// Map CLI args to `ExtractionConfig`.
async fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<ExtractionConfig> {
    let mut builder = ExtractionConfig::builder()
        .budget(Duration::from_secs(cli.budget_secs))
        .max_retries(cli.max_retries)
        .jitter(!cli.no_jitter)
        .api_timeout_secs(cli.api_timeout)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .reject_below(cli.reject_below)
        .warn_below(cli.warn_below)
        .pdf_dpi(cli.pdf_dpi);

    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref path) = cli.pdfium_lib {
        builder = builder.pdfium_library_path(path);
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
