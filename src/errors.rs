//! Typed errors for the OCR pipeline.
//!
//! These travel inside [`anyhow::Error`] like everything else, so callers add
//! context with `.context(...)` as usual. Code that needs to react to a
//! specific failure (the CLI, tests) can recover it with
//! [`anyhow::Error::downcast_ref`].

use thiserror::Error;

/// Errors with a meaning the caller may want to act on.
#[derive(Debug, Error)]
pub enum OcrError {
    /// Invalid parameters. Raised before any page is touched.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The requested backend name is not one we know.
    #[error("unsupported OCR backend {name:?} (supported: tesseract, paddleocr, easyocr)")]
    UnsupportedBackend { name: String },

    /// The backend exists, but something it needs is not installed.
    #[error("OCR backend {backend} is not available: missing {missing}")]
    BackendUnavailable { backend: String, missing: String },

    /// A tool needed to read documents is not installed.
    #[error("required tool {tool:?} was not found (is poppler-utils installed?)")]
    MissingDependency { tool: String },

    /// The input could not be parsed as the format it claims to be.
    #[error("cannot read document {path:?}: {message}")]
    Document { path: String, message: String },

    /// The backend failed while recognizing a page.
    #[error("recognition failed on page {page}: {message}")]
    Recognition { page: usize, message: String },
}

impl OcrError {
    /// Build a [`OcrError::Document`] error from a path and a message.
    pub fn document(path: &std::path::Path, message: impl Into<String>) -> Self {
        OcrError::Document {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

/// Find the first [`OcrError`] in an error chain, if any.
pub fn find_ocr_error(err: &anyhow::Error) -> Option<&OcrError> {
    err.chain().find_map(|cause| cause.downcast_ref::<OcrError>())
}
