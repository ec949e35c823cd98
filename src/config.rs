//! Typed, validated configuration for the rasterization path (component B).
//!
//! Recognized environment variables are a closed set; anything outside it
//! is ignored, and invalid values abort construction with a descriptive
//! error, the way `BrowserEngineConfig::with_env_overrides` validates
//! rather than silently clamping.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },
}

fn invalid(field: &'static str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.into(),
    }
}

/// Output image format. `jpeg` is normalized to `Jpg` at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpg,
}

impl ImageFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
        }
    }

    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpg),
            other => Err(invalid(
                "format",
                format!("'{other}' is not one of: png, jpg, jpeg"),
            )),
        }
    }
}

/// Validated, immutable rasterization configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionConfig {
    pub enabled: bool,
    pub dpi: u32,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub max_pages: u32,
    pub timeout_ms: u64,
    pub temp_dir: PathBuf,
    pub max_concurrent: usize,
    pub ocr_languages: String,
    pub ocr_pool_size: Option<usize>,
    pub temp_file_max_count: usize,
    pub temp_file_max_age_ms: u64,
    pub temp_file_max_size_bytes: u64,
    pub dependency_check_on_startup: bool,
}

/// Options passed to the rasterization library for one conversion call.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOptions {
    pub dpi: u32,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dpi: 200,
            format: ImageFormat::Png,
            width: 2000,
            height: 2000,
            max_pages: 1,
            timeout_ms: 30_000,
            temp_dir: std::env::temp_dir(),
            max_concurrent: 3,
            ocr_languages: "eng+fra".to_string(),
            ocr_pool_size: None,
            temp_file_max_count: 100,
            temp_file_max_age_ms: 3_600_000,
            temp_file_max_size_bytes: 500 * 1024 * 1024,
            dependency_check_on_startup: false,
        }
    }
}

impl ConversionConfig {
    /// Build configuration from the closed set of recognized environment
    /// variables, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PDF_CONVERSION_ENABLED") {
            cfg.enabled = parse_bool("PDF_CONVERSION_ENABLED", &v)?;
        }
        if let Ok(v) = std::env::var("PDF_CONVERSION_DPI") {
            cfg.dpi = parse_range("dpi", &v, 72, 600)?;
        }
        if let Ok(v) = std::env::var("PDF_CONVERSION_FORMAT") {
            cfg.format = ImageFormat::parse(&v)?;
        }
        if let Ok(v) = std::env::var("PDF_CONVERSION_WIDTH") {
            cfg.width = parse_range("width", &v, 100, 5000)?;
        }
        if let Ok(v) = std::env::var("PDF_CONVERSION_HEIGHT") {
            cfg.height = parse_range("height", &v, 100, 5000)?;
        }
        if let Ok(v) = std::env::var("PDF_CONVERSION_MAX_PAGES") {
            cfg.max_pages = parse_range("maxPages", &v, 1, 10)?;
        }
        if let Ok(v) = std::env::var("PDF_CONVERSION_TIMEOUT") {
            cfg.timeout_ms = parse_range("timeout", &v, 5_000, 300_000)?.into();
        }
        if let Ok(v) = std::env::var("PDF_CONVERSION_MAX_CONCURRENT") {
            cfg.max_concurrent = v
                .parse::<usize>()
                .map_err(|_| invalid("maxConcurrent", format!("'{v}' is not a positive integer")))?
                .max(1);
        }
        if let Ok(v) = std::env::var("PDF_TEMP_DIR") {
            if v.trim().is_empty() {
                return Err(invalid("tempDir", "must be a non-empty path"));
            }
            cfg.temp_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("OCR_LANGUAGES") {
            if v.trim().is_empty() {
                return Err(invalid("ocrLanguages", "must be non-empty"));
            }
            cfg.ocr_languages = v;
        }
        if let Ok(v) = std::env::var("OCR_POOL_SIZE") {
            cfg.ocr_pool_size = Some(
                v.parse::<usize>()
                    .map_err(|_| invalid("ocrPoolSize", format!("'{v}' is not a non-negative integer")))?,
            );
        }
        if let Ok(v) = std::env::var("TEMP_FILE_MAX_COUNT") {
            cfg.temp_file_max_count = v
                .parse()
                .map_err(|_| invalid("tempFileMaxCount", format!("'{v}' is not an integer")))?;
        }
        if let Ok(v) = std::env::var("TEMP_FILE_MAX_AGE_MS") {
            cfg.temp_file_max_age_ms = v
                .parse()
                .map_err(|_| invalid("tempFileMaxAgeMs", format!("'{v}' is not an integer")))?;
        }
        if let Ok(v) = std::env::var("TEMP_FILE_MAX_SIZE_BYTES") {
            cfg.temp_file_max_size_bytes = v
                .parse()
                .map_err(|_| invalid("tempFileMaxSizeBytes", format!("'{v}' is not an integer")))?;
        }
        if let Ok(v) = std::env::var("DEPENDENCY_CHECK_ON_STARTUP") {
            cfg.dependency_check_on_startup = parse_bool("DEPENDENCY_CHECK_ON_STARTUP", &v)?;
        }

        Ok(cfg)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn to_backend_options(&self) -> BackendOptions {
        BackendOptions {
            dpi: self.dpi,
            format: self.format,
            width: self.width,
            height: self.height,
        }
    }
}

fn parse_bool(field: &'static str, v: &str) -> Result<bool, ConfigError> {
    match v.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(invalid(field, format!("'{other}' is not a boolean"))),
    }
}

fn parse_range(field: &'static str, v: &str, min: u32, max: u32) -> Result<u32, ConfigError> {
    let n: u32 = v
        .parse()
        .map_err(|_| invalid(field, format!("'{v}' is not an integer")))?;
    if n < min || n > max {
        return Err(invalid(
            field,
            format!("{n} is outside the allowed range [{min}, {max}]"),
        ));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that mutate process environment must be serialized.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_spec_table() {
        let cfg = ConversionConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.dpi, 200);
        assert_eq!(cfg.format, ImageFormat::Png);
        assert_eq!(cfg.width, 2000);
        assert_eq!(cfg.height, 2000);
        assert_eq!(cfg.max_pages, 1);
        assert_eq!(cfg.timeout_ms, 30_000);
    }

    #[test]
    fn jpeg_normalizes_to_jpg() {
        assert_eq!(ImageFormat::parse("jpeg").unwrap(), ImageFormat::Jpg);
        assert_eq!(ImageFormat::parse("JPG").unwrap(), ImageFormat::Jpg);
    }

    #[test]
    fn rejects_out_of_range_dpi() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("PDF_CONVERSION_DPI", "10");
        let err = ConversionConfig::from_env().unwrap_err();
        std::env::remove_var("PDF_CONVERSION_DPI");
        assert!(matches!(err, ConfigError::Invalid { field: "dpi", .. }));
    }

    #[test]
    fn rejects_empty_temp_dir() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("PDF_TEMP_DIR", "");
        let err = ConversionConfig::from_env().unwrap_err();
        std::env::remove_var("PDF_TEMP_DIR");
        assert!(matches!(err, ConfigError::Invalid { field: "tempDir", .. }));
    }

    #[test]
    fn accepts_valid_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        std::env::set_var("PDF_CONVERSION_DPI", "300");
        std::env::set_var("PDF_CONVERSION_MAX_PAGES", "5");
        std::env::set_var("PDF_CONVERSION_FORMAT", "jpeg");
        let cfg = ConversionConfig::from_env().unwrap();
        std::env::remove_var("PDF_CONVERSION_DPI");
        std::env::remove_var("PDF_CONVERSION_MAX_PAGES");
        std::env::remove_var("PDF_CONVERSION_FORMAT");
        assert_eq!(cfg.dpi, 300);
        assert_eq!(cfg.max_pages, 5);
        assert_eq!(cfg.format, ImageFormat::Jpg);
    }
}
