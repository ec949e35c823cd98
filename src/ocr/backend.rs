//! OCR backend abstraction (component D's recognizer capability).
//!
//! A trait plus one concrete implementation, the way the corpus's OCR
//! manager supports multiple engines behind a common interface — kept to
//! a single default backend (Tesseract) since nothing here needs the
//! corpus's cloud-vision variants.

use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR backend not available: {0}")]
    BackendNotAvailable(String),
    #[error("OCR recognition failed: {0}")]
    RecognitionFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of running OCR on a single image.
#[derive(Debug, Clone)]
pub struct OcrOutput {
    pub text: String,
    /// Normalized to [0,1]. `None` when the backend does not report one,
    /// in which case the pool treats it as 1.0 for averaging purposes.
    pub confidence: Option<f32>,
}

/// One loaded, stateful recognizer. Implementations must be safe to use
/// from exactly one caller at a time — the pool enforces exclusivity.
pub trait OcrBackend: Send + Sync {
    fn is_available(&self) -> bool;
    fn availability_hint(&self) -> String;
    fn recognize(&self, image_path: &Path, language: &str) -> Result<OcrOutput, OcrError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A scripted backend for orchestrator/pool tests that never shells
    /// out to a real `tesseract` binary.
    pub struct StubBackend {
        pub available: bool,
        pub text: String,
        pub confidence: Option<f32>,
        pub fail: bool,
    }

    impl OcrBackend for StubBackend {
        fn is_available(&self) -> bool {
            self.available
        }

        fn availability_hint(&self) -> String {
            "stub backend".to_string()
        }

        fn recognize(&self, _image_path: &Path, _language: &str) -> Result<OcrOutput, OcrError> {
            if self.fail {
                return Err(OcrError::RecognitionFailed("stubbed failure".to_string()));
            }
            Ok(OcrOutput {
                text: self.text.clone(),
                confidence: self.confidence,
            })
        }
    }
}
