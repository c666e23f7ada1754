//! Text extraction from uploaded PDFs through external command-line tools.
//!
//! [`PageRasterizer`] renders the first page of a PDF into a PNG and [`OcrEngine`] recognises
//! text in that image. The default implementations shell out to Ghostscript and Tesseract;
//! arguments are always passed as a vector, never through a shell.

pub mod ghostscript;
pub mod tesseract;

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use thiserror::Error;
use tokio::process::Command;

pub use ghostscript::GhostscriptRasterizer;
pub use tesseract::TesseractEngine;

/// Errors raised while invoking external OCR tooling.
#[derive(Debug, Error)]
pub enum OcrError {
    /// The executable could not be started.
    #[error("failed to start {tool}: {source}")]
    Spawn {
        /// Tool name.
        tool: &'static str,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The tool ran but exited unsuccessfully.
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        /// Tool name.
        tool: &'static str,
        /// Exit status description.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },
    /// The tool reported success but did not produce its output file.
    #[error("expected output {} was not produced", .0.display())]
    MissingOutput(PathBuf),
    /// Local file handling failed.
    #[error("OCR I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders the first page of a PDF to a raster image.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Write page one of `pdf` to `png`.
    async fn rasterize_first_page(&self, pdf: &Path, png: &Path) -> Result<(), OcrError>;
}

/// Recognises text in a raster image.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Extract text from `image` using `language`. Empty output is a valid result.
    async fn extract_text(&self, image: &Path, language: &str) -> Result<String, OcrError>;
}

/// Run an external tool to completion and fail on a nonzero exit.
///
/// The child is killed if the returned future is dropped.
pub(crate) async fn run_tool<I, S>(tool: &'static str, program: &str, args: I) -> Result<Output, OcrError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| OcrError::Spawn { tool, source })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(OcrError::Failed {
            tool,
            status: output.status.to_string(),
            stderr,
        });
    }
    Ok(output)
}
