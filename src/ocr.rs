//! The OCR collaborator seam.
//!
//! OCR is an external engine, not something this crate implements: the
//! pipeline hands over a page image and gets text back. [`OcrEngine`] is
//! that seam; tests substitute deterministic stubs, production uses
//! [`TesseractOcr`], which shells out to the `tesseract` binary.
//!
//! ## Why a subprocess?
//!
//! Tesseract's C API bindings drag in a native build dependency and pin the
//! engine version at compile time. The CLI is installed everywhere tesseract
//! is, takes a file path and prints text to stdout, and upgrading the engine
//! is a package-manager operation. The handoff cost (one temp PNG per page)
//! is noise next to recognition time.

use async_trait::async_trait;
use image::DynamicImage;
use std::path::PathBuf;
use thiserror::Error;

use crate::retry::Transient;

/// Errors from a single OCR invocation.
#[derive(Debug, Error)]
pub enum OcrError {
    /// The engine binary could not be started (missing, not executable).
    #[error("failed to run OCR engine '{binary}': {detail}")]
    Spawn { binary: String, detail: String },

    /// The engine ran but exited non-zero.
    #[error("OCR engine failed (exit code {code}): {stderr}")]
    Failed { code: i32, stderr: String },

    /// The page image could not be encoded for the engine.
    #[error("failed to encode page image: {0}")]
    Encode(String),

    /// Temp-file plumbing failed.
    #[error("I/O error during OCR handoff: {0}")]
    Io(String),
}

impl Transient for OcrError {
    fn is_transient(&self) -> bool {
        // A missing binary or an image the engine rejects will not recover
        // on retry; only filesystem hiccups are worth a second attempt.
        matches!(self, OcrError::Io(_))
    }
}

/// Converts a page image to text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, image: &DynamicImage) -> Result<String, OcrError>;
}

/// [`OcrEngine`] backed by the `tesseract` CLI.
pub struct TesseractOcr {
    binary: PathBuf,
    language: String,
}

impl TesseractOcr {
    /// Use `tesseract` from `PATH` with English recognition.
    pub fn new() -> Self {
        Self {
            binary: PathBuf::from("tesseract"),
            language: "eng".to_string(),
        }
    }

    /// Use a specific tesseract binary.
    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary = path.into();
        self
    }

    /// Set the recognition language (tesseract `-l` flag).
    pub fn with_language(mut self, lang: impl Into<String>) -> Self {
        self.language = lang.into();
        self
    }

    /// Probe whether the configured binary runs at all.
    pub fn is_available(&self) -> bool {
        std::process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize(&self, image: &DynamicImage) -> Result<String, OcrError> {
        // PNG encoding is CPU-bound; keep it off the async workers.
        let img = image.clone();
        let (dir, png_path) = tokio::task::spawn_blocking(
            move || -> Result<(tempfile::TempDir, PathBuf), OcrError> {
                let dir = tempfile::tempdir().map_err(|e| OcrError::Io(e.to_string()))?;
                let path = dir.path().join("page.png");
                img.save_with_format(&path, image::ImageFormat::Png)
                    .map_err(|e| OcrError::Encode(e.to_string()))?;
                Ok((dir, path))
            },
        )
        .await
        .map_err(|e| OcrError::Io(format!("encode task panicked: {e}")))??;

        // tesseract <input> stdout -l <lang>
        let output = tokio::process::Command::new(&self.binary)
            .arg(&png_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .output()
            .await
            .map_err(|e| OcrError::Spawn {
                binary: self.binary.display().to_string(),
                detail: e.to_string(),
            })?;

        // Keep the temp dir alive until the subprocess has read the file.
        drop(dir);

        if !output.status.success() {
            return Err(OcrError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
