//! Text recognition with the Tesseract CLI.

use super::{OcrEngine, OcrError, run_tool};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;

const TOOL: &str = "tesseract";

/// Invokes `tesseract <image> stdout -l <language>` and returns its standard output.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    program: String,
}

impl TesseractEngine {
    /// Use the given executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn arguments(image: &Path, language: &str) -> Vec<OsString> {
        vec![
            image.as_os_str().to_owned(),
            "stdout".into(),
            "-l".into(),
            language.into(),
        ]
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    async fn extract_text(&self, image: &Path, language: &str) -> Result<String, OcrError> {
        let output = run_tool(TOOL, &self.program, Self::arguments(image, language)).await?;
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::debug!(image = %image.display(), language, chars = text.len(), "Recognised text");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_write_to_stdout_with_language() {
        let args: Vec<String> = TesseractEngine::arguments(Path::new("/tmp/page.png"), "deu+eng")
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["/tmp/page.png", "stdout", "-l", "deu+eng"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_becomes_trimmed_text() {
        // echo prints its arguments, which shows exactly what the engine passed
        let engine = TesseractEngine::new("echo");
        let text = engine
            .extract_text(Path::new("/tmp/page.png"), "eng")
            .await
            .expect("text");
        assert_eq!(text, "/tmp/page.png stdout -l eng");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn empty_output_is_not_an_error() {
        let engine = TesseractEngine::new("true");
        let text = engine
            .extract_text(Path::new("/tmp/blank.png"), "eng")
            .await
            .expect("empty text");
        assert!(text.is_empty());
    }
}
