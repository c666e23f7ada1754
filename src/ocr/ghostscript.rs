//! First-page rendering with Ghostscript.

use super::{OcrError, PageRasterizer, run_tool};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;

const TOOL: &str = "ghostscript";

/// Invokes `gs` to render page one of a PDF into a 24-bit PNG.
#[derive(Debug, Clone)]
pub struct GhostscriptRasterizer {
    program: String,
    dpi: u32,
}

impl GhostscriptRasterizer {
    /// Use `program` at the given resolution.
    pub fn new(program: impl Into<String>, dpi: u32) -> Self {
        Self {
            program: program.into(),
            dpi,
        }
    }

    fn arguments(&self, pdf: &Path, png: &Path) -> Vec<OsString> {
        let mut output_file = OsString::from("-sOutputFile=");
        output_file.push(png);
        vec![
            "-dQUIET".into(),
            "-dSAFER".into(),
            "-dBATCH".into(),
            "-dNOPAUSE".into(),
            "-sDEVICE=png16m".into(),
            format!("-r{}", self.dpi).into(),
            "-dFirstPage=1".into(),
            "-dLastPage=1".into(),
            output_file,
            pdf.as_os_str().to_owned(),
        ]
    }
}

#[async_trait]
impl PageRasterizer for GhostscriptRasterizer {
    async fn rasterize_first_page(&self, pdf: &Path, png: &Path) -> Result<(), OcrError> {
        run_tool(TOOL, &self.program, self.arguments(pdf, png)).await?;
        if !tokio::fs::try_exists(png).await? {
            return Err(OcrError::MissingOutput(png.to_path_buf()));
        }
        tracing::debug!(pdf = %pdf.display(), png = %png.display(), dpi = self.dpi, "Rendered first page");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_render_only_the_first_page() {
        let rasterizer = GhostscriptRasterizer::new("gs", 300);
        let args = rasterizer.arguments(Path::new("/tmp/in.pdf"), Path::new("/tmp/out page.png"));
        let args: Vec<String> = args
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-dQUIET",
                "-dSAFER",
                "-dBATCH",
                "-dNOPAUSE",
                "-sDEVICE=png16m",
                "-r300",
                "-dFirstPage=1",
                "-dLastPage=1",
                "-sOutputFile=/tmp/out page.png",
                "/tmp/in.pdf",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_exit_without_output_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rasterizer = GhostscriptRasterizer::new("true", 72);
        let png = dir.path().join("page.png");

        let error = rasterizer
            .rasterize_first_page(&dir.path().join("source.pdf"), &png)
            .await
            .expect_err("no output");
        assert!(matches!(error, OcrError::MissingOutput(path) if path == png));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rasterizer = GhostscriptRasterizer::new("false", 72);

        let error = rasterizer
            .rasterize_first_page(&dir.path().join("source.pdf"), &dir.path().join("page.png"))
            .await
            .expect_err("exit status");
        assert!(matches!(error, OcrError::Failed { tool: TOOL, .. }));
    }
}
