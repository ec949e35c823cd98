//! Bounded-concurrency FIFO gate serializing calls into the rasterization
//! subprocess (component E). The admission queue plus semaphore mirrors
//! the work-queue's claim/complete lifecycle, adapted from a DB-backed
//! claim to an in-process ticket: a waiter holds its place in line until
//! a permit frees up or its deadline passes.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{BackendOptions, ImageFormat};
use crate::ocr::pdf_utils::find_page_image;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("invalid conversion input: {0}")]
    InvalidInput(String),
    #[error("admission queue deadline exceeded")]
    QueueTimeout,
    #[error("rasterization deadline exceeded")]
    RequestTimeout,
    #[error("rasterizer exited non-zero: {stderr}")]
    BackendFailure { stderr: String },
    #[error("rasterizer produced invalid output: {0}")]
    InvalidOutput(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub pdf_path: PathBuf,
    pub page_range: std::ops::RangeInclusive<u32>,
    pub session_id: String,
    pub deadline: Instant,
}

#[derive(Debug, Clone)]
pub struct PageImage {
    pub page_path: PathBuf,
    pub page_number: u32,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GateStats {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

pub struct ConversionGate {
    semaphore: Semaphore,
    max_concurrent: usize,
    active: AtomicUsize,
    queued: AtomicUsize,
}

impl ConversionGate {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrent),
            max_concurrent,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn stats(&self) -> GateStats {
        GateStats {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent,
        }
    }

    /// Enqueues, waits for admission (FIFO via `tokio::sync::Semaphore`'s
    /// fair wait queue), rasterizes, and returns one image per requested
    /// page in ascending page order. Blocks up to `req.deadline` for
    /// admission *plus* rasterization.
    pub async fn submit(
        &self,
        req: &ConversionRequest,
        output_dir: &Path,
        options: &BackendOptions,
    ) -> Result<Vec<PageImage>, ConversionError> {
        if Instant::now() >= req.deadline {
            return Err(ConversionError::QueueTimeout);
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        let remaining = req.deadline.saturating_duration_since(Instant::now());
        let permit = tokio::time::timeout(remaining, self.semaphore.acquire()).await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let _permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(ConversionError::QueueTimeout),
            Err(_elapsed) => return Err(ConversionError::QueueTimeout),
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self.rasterize(req, output_dir, options).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn rasterize(
        &self,
        req: &ConversionRequest,
        output_dir: &Path,
        options: &BackendOptions,
    ) -> Result<Vec<PageImage>, ConversionError> {
        let remaining = req.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConversionError::RequestTimeout);
        }

        let pdf_path = req.pdf_path.clone();
        let output_prefix = output_dir.join("page");
        let first = *req.page_range.start();
        let last = *req.page_range.end();
        let backend_options = options.clone();

        let spawn_result = tokio::time::timeout(
            remaining,
            tokio::task::spawn_blocking(move || {
                run_pdftoppm(&pdf_path, first, last, &output_prefix, &backend_options)
            }),
        )
        .await;

        match spawn_result {
            Err(_elapsed) => return Err(ConversionError::RequestTimeout),
            Ok(Err(join_err)) => {
                return Err(ConversionError::BackendFailure {
                    stderr: format!("rasterizer task panicked: {join_err}"),
                })
            }
            Ok(Ok(run_result)) => run_result?,
        };

        self.verify_output(output_dir, req.page_range.clone(), options.format)
    }

    fn verify_output(
        &self,
        output_dir: &Path,
        page_range: std::ops::RangeInclusive<u32>,
        format: ImageFormat,
    ) -> Result<Vec<PageImage>, ConversionError> {
        let mut images = Vec::new();
        for page_number in page_range {
            let path = find_page_image(output_dir, page_number, format.as_str()).ok_or_else(|| {
                ConversionError::InvalidOutput(format!("no output file for page {page_number}"))
            })?;
            let metadata = std::fs::metadata(&path)?;
            if metadata.len() == 0 {
                return Err(ConversionError::InvalidOutput(format!(
                    "output file for page {page_number} is empty"
                )));
            }
            images.push(PageImage {
                page_path: path,
                page_number,
                size_bytes: metadata.len(),
            });
        }
        images.sort_by_key(|i| i.page_number);
        Ok(images)
    }
}

fn run_pdftoppm(
    pdf_path: &Path,
    first_page: u32,
    last_page: u32,
    output_prefix: &Path,
    options: &BackendOptions,
) -> Result<(), ConversionError> {
    let status = Command::new("pdftoppm")
        .arg(match options.format {
            ImageFormat::Png => "-png",
            ImageFormat::Jpg => "-jpeg",
        })
        .args(["-r", &options.dpi.to_string()])
        .args(["-scale-to-x", &options.width.to_string()])
        .args(["-scale-to-y", &options.height.to_string()])
        .args(["-f", &first_page.to_string()])
        .args(["-l", &last_page.to_string()])
        .arg(pdf_path)
        .arg(output_prefix)
        .output();

    match status {
        Ok(output) if output.status.success() => {
            debug!(?pdf_path, first_page, last_page, "pdftoppm completed");
            Ok(())
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!(%stderr, "pdftoppm exited non-zero");
            Err(ConversionError::BackendFailure { stderr })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ConversionError::InvalidInput("pdftoppm not found on PATH".to_string()))
        }
        Err(e) => Err(ConversionError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn options() -> BackendOptions {
        BackendOptions {
            dpi: 200,
            format: ImageFormat::Png,
            width: 2000,
            height: 2000,
        }
    }

    #[tokio::test]
    async fn deadline_equal_to_now_rejected_before_backend() {
        let gate = ConversionGate::new(2);
        let req = ConversionRequest {
            pdf_path: PathBuf::from("/nonexistent.pdf"),
            page_range: 1..=1,
            session_id: "s1".to_string(),
            deadline: Instant::now(),
        };
        let dir = tempdir().unwrap();
        let result = gate.submit(&req, dir.path(), &options()).await;
        assert!(matches!(result, Err(ConversionError::QueueTimeout)));
    }

    #[tokio::test]
    async fn stats_max_concurrent_matches_constructor() {
        let gate = ConversionGate::new(3);
        assert_eq!(gate.stats().max_concurrent, 3);
        assert_eq!(gate.stats().active, 0);
    }

    #[tokio::test]
    async fn missing_pdftoppm_binary_or_bad_input_surfaces_typed_error() {
        let gate = ConversionGate::new(1);
        let req = ConversionRequest {
            pdf_path: PathBuf::from("/nonexistent.pdf"),
            page_range: 1..=1,
            session_id: "s1".to_string(),
            deadline: Instant::now() + Duration::from_secs(5),
        };
        let dir = tempdir().unwrap();
        let result = gate.submit(&req, dir.path(), &options()).await;
        assert!(result.is_err());
    }
}
