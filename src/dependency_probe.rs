//! Detects availability of the PDF rasterization toolchain (component A).
//!
//! Two distinct external requirements: a native image-processing backend
//! (either of two interchangeable binaries, `backendG`/`backendI`) and the
//! rasterization library binding to one of them. Modeled the same way
//! `CTorHiddenService::find_tor_binary` searches a custom path then PATH
//! candidates, with a result cached under a mutex and refreshed on a TTL.

use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const CACHE_TTL: Duration = Duration::from_secs(30);

/// Candidate binary names for backend G (ghostscript-family rasterizer).
const BACKEND_G_CANDIDATES: &[&str] = &["gs", "gswin64c", "gswin32c"];
/// Candidate binary names for backend I (poppler-family rasterizer).
const BACKEND_I_CANDIDATES: &[&str] = &["pdftoppm"];
/// The rasterization library's own CLI shim, used only to confirm linkage.
const RASTER_LIB_CANDIDATES: &[&str] = &["pdftoppm"];

#[derive(Debug, Clone, Default)]
pub struct DependencyStatus {
    pub available: bool,
    pub version: Option<String>,
    pub path: Option<String>,
    pub hint: String,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyReport {
    pub backend_g: DependencyStatus,
    pub backend_i: DependencyStatus,
    pub raster_lib: DependencyStatus,
}

/// Per-platform install hints, one set per OS family.
struct PlatformHints {
    backend_g: &'static str,
    backend_i: &'static str,
    raster_lib: &'static str,
}

const HINTS_WIN: PlatformHints = PlatformHints {
    backend_g: "Ghostscript not found. Install from https://ghostscript.com/releases/",
    backend_i: "pdftoppm not found. Install poppler for Windows and add it to PATH.",
    raster_lib: "poppler binaries not found on PATH.",
};
const HINTS_MAC: PlatformHints = PlatformHints {
    backend_g: "Ghostscript not found. Install with: brew install ghostscript",
    backend_i: "pdftoppm not found. Install with: brew install poppler",
    raster_lib: "poppler not found. Install with: brew install poppler",
};
const HINTS_LIN: PlatformHints = PlatformHints {
    backend_g: "Ghostscript not found. Install with: apt install ghostscript",
    backend_i: "pdftoppm not found. Install with: apt install poppler-utils",
    raster_lib: "poppler not found. Install with: apt install poppler-utils",
};

fn platform_hints() -> &'static PlatformHints {
    if cfg!(windows) {
        &HINTS_WIN
    } else if cfg!(target_os = "macos") {
        &HINTS_MAC
    } else {
        &HINTS_LIN
    }
}

/// Optional operator-supplied override paths for each candidate set.
#[derive(Debug, Clone, Default)]
pub struct ProbeOverrides {
    pub backend_g_path: Option<PathBuf>,
    pub backend_i_path: Option<PathBuf>,
}

pub struct DependencyProbe {
    overrides: ProbeOverrides,
    cached: Mutex<Option<(DependencyReport, Instant)>>,
}

impl DependencyProbe {
    pub fn new(overrides: ProbeOverrides) -> Self {
        Self {
            overrides,
            cached: Mutex::new(None),
        }
    }

    /// Runs the version probes, bypassing the cache. Synchronous and
    /// subprocess-spawning; callers on an async runtime should go through
    /// `report()`, which offloads this to a blocking thread.
    pub fn probe(&self) -> DependencyReport {
        Self::run_probe(&self.overrides)
    }

    fn run_probe(overrides: &ProbeOverrides) -> DependencyReport {
        let hints = platform_hints();

        let backend_g = Self::check_candidate(
            overrides.backend_g_path.as_deref(),
            BACKEND_G_CANDIDATES,
            hints.backend_g,
        );
        let backend_i = Self::check_candidate(
            overrides.backend_i_path.as_deref(),
            BACKEND_I_CANDIDATES,
            hints.backend_i,
        );
        let raster_lib = Self::check_candidate(None, RASTER_LIB_CANDIDATES, hints.raster_lib);

        DependencyReport {
            backend_g,
            backend_i,
            raster_lib,
        }
    }

    /// Cached `probe()`, refreshed at most every 30s. The cache miss path
    /// runs the version probes on a blocking thread (matching
    /// `conversion_gate.rs::rasterize` and `ocr/pool.rs::recognize`) so a
    /// multi-probe round trip never parks a tokio worker thread.
    pub async fn report(&self) -> DependencyReport {
        let mut guard = self.cached.lock().await;
        if let Some((report, at)) = guard.as_ref() {
            if at.elapsed() < CACHE_TTL {
                return report.clone();
            }
        }
        let overrides = self.overrides.clone();
        let report = tokio::task::spawn_blocking(move || Self::run_probe(&overrides))
            .await
            .unwrap_or_default();
        *guard = Some((report.clone(), Instant::now()));
        report
    }

    pub async fn is_conversion_supported(&self) -> bool {
        let report = self.report().await;
        report.raster_lib.available && (report.backend_g.available || report.backend_i.available)
    }

    fn check_candidate(
        override_path: Option<&std::path::Path>,
        candidates: &[&str],
        hint: &str,
    ) -> DependencyStatus {
        if let Some(path) = override_path {
            if path.exists() {
                let version = run_version_probe(path);
                return DependencyStatus {
                    available: true,
                    version,
                    path: Some(path.display().to_string()),
                    hint: hint.to_string(),
                };
            }
        }

        for candidate in candidates {
            if let Ok(path) = which::which(candidate) {
                let version = run_version_probe(&path);
                debug!(binary = candidate, ?path, "dependency probe found binary");
                return DependencyStatus {
                    available: true,
                    version,
                    path: Some(path.display().to_string()),
                    hint: hint.to_string(),
                };
            }
        }

        DependencyStatus {
            available: false,
            version: None,
            path: None,
            hint: hint.to_string(),
        }
    }
}

/// Runs `<binary> -v` with a bounded timeout and extracts the first line of
/// output as a version string. A non-zero exit or timeout is swallowed —
/// version information is best-effort, not required for availability.
fn run_version_probe(path: &std::path::Path) -> Option<String> {
    let path = path.to_path_buf();
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::spawn(move || {
        let output = Command::new(&path).arg("-v").output();
        let _ = tx.send(output);
    });

    match rx.recv_timeout(PROBE_TIMEOUT) {
        Ok(Ok(output)) => {
            let combined = if !output.stdout.is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            let text = String::from_utf8_lossy(&combined);
            let first_line = text.lines().next()?.trim();
            if first_line.is_empty() {
                None
            } else {
                Some(first_line.to_string())
            }
        }
        _ => {
            // Either the probe errored, or it's still running past our
            // timeout; either way we don't block on it further.
            let _ = handle.thread().id();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_caches_between_calls() {
        let probe = DependencyProbe::new(ProbeOverrides::default());
        let first = probe.report().await;
        let second = probe.report().await;
        assert_eq!(first.raster_lib.available, second.raster_lib.available);
    }

    #[test]
    fn unresolvable_candidate_is_unavailable() {
        let probe = DependencyProbe::new(ProbeOverrides {
            backend_g_path: Some(PathBuf::from("/nonexistent/not-a-real-binary")),
            backend_i_path: None,
        });
        let report = probe.probe();
        // Falls through to PATH search for the real candidate names; on a
        // CI box without ghostscript this reports unavailable, which is the
        // behavior under test (override missing -> falls back to PATH).
        assert!(report.backend_g.hint.contains("Ghostscript") || report.backend_g.available);
    }

    #[tokio::test]
    async fn is_conversion_supported_requires_raster_lib_and_one_backend() {
        let probe = DependencyProbe::new(ProbeOverrides::default());
        let supported = probe.is_conversion_supported().await;
        let report = probe.report().await;
        assert_eq!(
            supported,
            report.raster_lib.available && (report.backend_g.available || report.backend_i.available)
        );
    }
}
