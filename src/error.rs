//! Top-level error type returned across the core's API boundary.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::ConfigError;
use crate::conversion_gate::ConversionError;
use crate::dependency_probe::DependencyReport;
use crate::ocr::backend::OcrError;
use crate::temp_registry::TempRegistryError;

/// Error class names as they appear in the user-visible failure shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    DependencyMissing,
    ConversionInvalidInput,
    ConversionTimeout,
    ConversionBackendFailure,
    ConversionInvalidOutput,
    OcrFailure,
    SystemIo,
    Cancelled,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DependencyMissing => "DependencyMissing",
            Self::ConversionInvalidInput => "ConversionInvalidInput",
            Self::ConversionTimeout => "ConversionTimeout",
            Self::ConversionBackendFailure => "ConversionBackendFailure",
            Self::ConversionInvalidOutput => "ConversionInvalidOutput",
            Self::OcrFailure => "OcrFailure",
            Self::SystemIo => "SystemIO",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The core's top-level error, returned on `extract()`'s `Err` path.
///
/// Only reached when the fallback rule in the orchestrator does not apply
/// (the embedded PDF text was empty, so there is nothing to fall back to).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("PDF rasterization dependencies unavailable: {0}")]
    DependencyMissing(DependencyMissingDetails),

    #[error("conversion input invalid: {0}")]
    ConversionInvalidInput(String),

    #[error("conversion deadline exceeded")]
    ConversionTimeout,

    #[error("conversion backend exited non-zero: {stderr}")]
    ConversionBackendFailure { stderr: String },

    #[error("conversion produced invalid output: {0}")]
    ConversionInvalidOutput(String),

    #[error("OCR recognition failed: {0}")]
    OcrFailure(String),

    #[error("filesystem error on temp resources: {0}")]
    SystemIo(String),

    #[error("cancelled")]
    Cancelled,
}

/// Enumerates which of {backendG, backendI, rasterLib} are absent, with hints.
#[derive(Debug, Clone)]
pub struct DependencyMissingDetails {
    pub missing: Vec<String>,
    pub hints: BTreeMap<String, String>,
}

impl std::fmt::Display for DependencyMissingDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.missing.join(", "))
    }
}

impl DependencyMissingDetails {
    pub fn from_report(report: &DependencyReport) -> Self {
        let mut missing = Vec::new();
        let mut hints = BTreeMap::new();
        if !report.backend_g.available {
            missing.push("backendG".to_string());
            hints.insert("backendG".to_string(), report.backend_g.hint.clone());
        }
        if !report.backend_i.available {
            missing.push("backendI".to_string());
            hints.insert("backendI".to_string(), report.backend_i.hint.clone());
        }
        if !report.raster_lib.available {
            missing.push("rasterLib".to_string());
            hints.insert("rasterLib".to_string(), report.raster_lib.hint.clone());
        }
        Self { missing, hints }
    }
}

impl CoreError {
    /// The error class this failure falls under, per the taxonomy.
    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::DependencyMissing(_) => ErrorClass::DependencyMissing,
            Self::ConversionInvalidInput(_) => ErrorClass::ConversionInvalidInput,
            Self::ConversionTimeout => ErrorClass::ConversionTimeout,
            Self::ConversionBackendFailure { .. } => ErrorClass::ConversionBackendFailure,
            Self::ConversionInvalidOutput(_) => ErrorClass::ConversionInvalidOutput,
            Self::OcrFailure(_) => ErrorClass::OcrFailure,
            Self::SystemIo(_) => ErrorClass::SystemIo,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }
}

impl From<ConversionError> for CoreError {
    fn from(e: ConversionError) -> Self {
        match e {
            ConversionError::InvalidInput(msg) => Self::ConversionInvalidInput(msg),
            ConversionError::QueueTimeout | ConversionError::RequestTimeout => {
                Self::ConversionTimeout
            }
            ConversionError::BackendFailure { stderr } => Self::ConversionBackendFailure { stderr },
            ConversionError::InvalidOutput(msg) => Self::ConversionInvalidOutput(msg),
            ConversionError::Io(e) => Self::SystemIo(e.to_string()),
        }
    }
}

impl From<OcrError> for CoreError {
    fn from(e: OcrError) -> Self {
        Self::OcrFailure(e.to_string())
    }
}

impl From<TempRegistryError> for CoreError {
    fn from(e: TempRegistryError) -> Self {
        Self::SystemIo(e.to_string())
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        // Configuration errors surface during construction, before a session
        // exists; there is no more specific class for them in the taxonomy.
        Self::ConversionInvalidInput(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_names_match_taxonomy() {
        assert_eq!(ErrorClass::DependencyMissing.as_str(), "DependencyMissing");
        assert_eq!(ErrorClass::SystemIo.as_str(), "SystemIO");
        assert_eq!(ErrorClass::Cancelled.as_str(), "Cancelled");
    }

    #[test]
    fn conversion_error_maps_to_matching_class() {
        let core: CoreError = ConversionError::QueueTimeout.into();
        assert_eq!(core.error_class(), ErrorClass::ConversionTimeout);

        let core: CoreError = ConversionError::BackendFailure {
            stderr: "boom".into(),
        }
        .into();
        assert_eq!(core.error_class(), ErrorClass::ConversionBackendFailure);
    }
}
