//! Per-session structured event log and aggregate counters (component G).
//!
//! Aggregates are lock-free atomics, independent of the bounded session
//! log's retention, the way the corpus keeps per-domain rate-limit stats
//! as a simple in-memory struct (`DomainStats`) separate from whatever
//! history is retained elsewhere.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Mutex;
use tracing::info;

use crate::error::ErrorClass;

const DEFAULT_RING_CAPACITY: usize = 1000;
pub const SUMMARY_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct StageRecord {
    pub name: &'static str,
    pub started_at: Instant,
    pub finished_at: Option<Instant>,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub pdf_path: String,
    pub started_at: SystemTime,
    pub stages: Vec<StageRecord>,
    pub decision: Option<&'static str>,
    pub temp_files_created: u64,
    pub temp_files_cleaned: u64,
    pub temp_bytes_created: u64,
    pub error_class: Option<ErrorClass>,
}

impl SessionRecord {
    fn new(session_id: String, pdf_path: String) -> Self {
        Self {
            session_id,
            pdf_path,
            started_at: SystemTime::now(),
            stages: Vec::new(),
            decision: None,
            temp_files_created: 0,
            temp_files_cleaned: 0,
            temp_bytes_created: 0,
            error_class: None,
        }
    }
}

/// A handle into an open session record; callers mark stage boundaries on
/// it, then hand it back to the log via `finish`.
pub struct SessionHandle {
    record: SessionRecord,
}

impl SessionHandle {
    pub fn start_stage(&mut self, name: &'static str) {
        self.record.stages.push(StageRecord {
            name,
            started_at: Instant::now(),
            finished_at: None,
            ok: false,
            error: None,
        });
    }

    pub fn finish_stage(&mut self, name: &'static str, ok: bool, error: Option<String>) {
        if let Some(stage) = self.record.stages.iter_mut().rev().find(|s| s.name == name) {
            stage.finished_at = Some(Instant::now());
            stage.ok = ok;
            stage.error = error;
        }
    }

    pub fn set_decision(&mut self, decision: &'static str) {
        self.record.decision = Some(decision);
    }

    pub fn record_temp_created(&mut self, n: u64) {
        self.record.temp_files_created += n;
    }

    pub fn record_temp_bytes(&mut self, bytes: u64) {
        self.record.temp_bytes_created += bytes;
    }

    pub fn record_temp_cleaned(&mut self, n: u64) {
        self.record.temp_files_cleaned += n;
    }

    pub fn set_error_class(&mut self, class: ErrorClass) {
        self.record.error_class = Some(class);
    }
}

#[derive(Debug, Default, Clone)]
pub struct Aggregates {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_samples: Vec<u64>,
    pub conversion_duration_samples: Vec<u64>,
    pub ocr_duration_samples: Vec<u64>,
    pub error_counts: std::collections::BTreeMap<&'static str, u64>,
    pub temp_files_created: u64,
    pub temp_bytes_created: u64,
}

struct AtomicAggregates {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    temp_files_live: AtomicU64,
    temp_bytes_live: AtomicU64,
    error_counts: Mutex<std::collections::BTreeMap<&'static str, u64>>,
    durations: Mutex<DurationSamples>,
}

#[derive(Default)]
struct DurationSamples {
    total_ms: Vec<u64>,
    conversion_ms: Vec<u64>,
    ocr_ms: Vec<u64>,
}

impl Default for AtomicAggregates {
    fn default() -> Self {
        Self {
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            temp_files_live: AtomicU64::new(0),
            temp_bytes_live: AtomicU64::new(0),
            error_counts: Mutex::new(std::collections::BTreeMap::new()),
            durations: Mutex::new(DurationSamples::default()),
        }
    }
}

pub struct SessionLog {
    ring: Mutex<VecDeque<SessionRecord>>,
    capacity: usize,
    aggregates: AtomicAggregates,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            aggregates: AtomicAggregates::default(),
        }
    }

    pub fn open_session(&self, session_id: String, pdf_path: String) -> SessionHandle {
        self.aggregates.attempts.fetch_add(1, Ordering::Relaxed);
        SessionHandle {
            record: SessionRecord::new(session_id, pdf_path),
        }
    }

    /// Closes a session: records it into the bounded ring (evicting the
    /// oldest on overflow) and folds its outcome into the aggregates.
    pub async fn finish_session(
        &self,
        handle: SessionHandle,
        success: bool,
        total_ms: u64,
        conversion_ms: Option<u64>,
        ocr_ms: Option<u64>,
    ) {
        let record = handle.record;

        self.aggregates
            .temp_files_live
            .fetch_add(record.temp_files_created, Ordering::Relaxed);
        self.aggregates
            .temp_bytes_live
            .fetch_add(record.temp_bytes_created, Ordering::Relaxed);

        if success {
            self.aggregates.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.aggregates.failures.fetch_add(1, Ordering::Relaxed);
            if let Some(class) = record.error_class {
                let mut counts = self.aggregates.error_counts.lock().await;
                *counts.entry(class.as_str()).or_insert(0) += 1;
            }
        }

        {
            let mut durations = self.aggregates.durations.lock().await;
            durations.total_ms.push(total_ms);
            if let Some(ms) = conversion_ms {
                durations.conversion_ms.push(ms);
            }
            if let Some(ms) = ocr_ms {
                durations.ocr_ms.push(ms);
            }
        }

        info!(
            session_id = %record.session_id,
            success,
            total_ms,
            decision = record.decision,
            "extraction session complete"
        );

        let mut ring = self.ring.lock().await;
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    pub async fn recent(&self, n: usize) -> Vec<SessionRecord> {
        let ring = self.ring.lock().await;
        ring.iter().rev().take(n).cloned().collect()
    }

    pub fn success_rate(&self) -> f64 {
        let successes = self.aggregates.successes.load(Ordering::Relaxed);
        let attempts = self.aggregates.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            0.0
        } else {
            successes as f64 / attempts as f64
        }
    }

    pub async fn summary(&self) -> Aggregates {
        let durations = self.aggregates.durations.lock().await;
        let error_counts = self.aggregates.error_counts.lock().await;
        Aggregates {
            attempts: self.aggregates.attempts.load(Ordering::Relaxed),
            successes: self.aggregates.successes.load(Ordering::Relaxed),
            failures: self.aggregates.failures.load(Ordering::Relaxed),
            total_duration_samples: durations.total_ms.clone(),
            conversion_duration_samples: durations.conversion_ms.clone(),
            ocr_duration_samples: durations.ocr_ms.clone(),
            error_counts: error_counts.clone(),
            temp_files_created: self.aggregates.temp_files_live.load(Ordering::Relaxed),
            temp_bytes_created: self.aggregates.temp_bytes_live.load(Ordering::Relaxed),
        }
    }

    /// Spawns the periodic (15-minute) summary emission task. Returns a
    /// handle the caller can abort on shutdown.
    pub fn spawn_periodic_summary(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
            loop {
                interval.tick().await;
                let summary = self.summary().await;
                info!(
                    attempts = summary.attempts,
                    successes = summary.successes,
                    failures = summary.failures,
                    success_rate = self.success_rate(),
                    "periodic session summary"
                );
            }
        })
    }
}

impl Default for SessionLog {
    fn default() -> Self {
        Self::new()
    }
}

pub fn percentile(samples: &[u64], p: f64) -> Option<u64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted.get(idx).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_past_capacity() {
        let log = SessionLog::with_capacity(2);
        for i in 0..3 {
            let handle = log.open_session(format!("s{i}"), "/tmp/x.pdf".to_string());
            log.finish_session(handle, true, 10, None, None).await;
        }
        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].session_id, "s2");
        assert_eq!(recent[1].session_id, "s1");
    }

    #[tokio::test]
    async fn success_rate_reflects_outcomes() {
        let log = SessionLog::new();
        let h1 = log.open_session("a".to_string(), "x".to_string());
        log.finish_session(h1, true, 1, None, None).await;
        let h2 = log.open_session("b".to_string(), "x".to_string());
        log.finish_session(h2, false, 1, None, None).await;
        assert!((log.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn percentile_of_empty_is_none() {
        assert_eq!(percentile(&[], 0.95), None);
    }

    #[test]
    fn percentile_p50_of_sorted_samples() {
        let samples = vec![10, 20, 30, 40, 50];
        assert_eq!(percentile(&samples, 0.5), Some(30));
    }
}
