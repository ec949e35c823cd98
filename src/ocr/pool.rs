//! Bounded pool of long-lived OCR workers (component D).
//!
//! Health tracking follows `BrowserPool`'s consecutive-failure-counter
//! shape, adapted from a multi-endpoint fetch pool to a single-process
//! slot pool: instead of marking a remote browser unhealthy, a slot with
//! three consecutive engine-internal failures is retired and replaced off
//! the hot path.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use super::backend::{OcrBackend, OcrOutput};

const DEAD_AFTER_CONSECUTIVE_FAILURES: u32 = 3;
const OCR_WALL_CLOCK_LIMIT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool has no workers or is closing")]
    PoolUnavailable,
    #[error("acquire deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Recycling,
    Dead,
}

/// Outcome reported to `release`, driving the recycle decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

struct WorkerSlot {
    id: u64,
    state: SlotState,
    jobs_served: u64,
    consecutive_failures: u32,
    last_used_at: Instant,
    backend: Arc<dyn OcrBackend>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub busy: usize,
    pub recycling: usize,
    pub waiters: usize,
}

/// An acquired slot. Must be returned via `release`; this is an explicit,
/// non-Drop-enforced handle (unlike the corpus's `WorkHandle`, the pool
/// itself tracks slot state under its own mutex, so nothing is lost if a
/// caller forgets — the slot simply stays busy until released).
pub struct SlotHandle {
    id: u64,
}

type BackendFactory = Arc<dyn Fn() -> Arc<dyn OcrBackend> + Send + Sync>;

pub struct OcrPool {
    slots: Mutex<Vec<WorkerSlot>>,
    idle_queue: Mutex<VecDeque<u64>>,
    notify: Notify,
    waiters: std::sync::atomic::AtomicUsize,
    recycle_after: u64,
    factory: BackendFactory,
    next_id: std::sync::atomic::AtomicU64,
}

impl OcrPool {
    /// Builds a pool of `size` workers, each constructed via `factory`.
    /// `recycle_after` is the `jobsServed` ceiling before proactive
    /// recycling (separate from failure-triggered recycling).
    pub fn new(
        size: usize,
        recycle_after: u64,
        factory: impl Fn() -> Arc<dyn OcrBackend> + Send + Sync + 'static,
    ) -> Self {
        let factory: BackendFactory = Arc::new(factory);
        let mut slots = Vec::with_capacity(size);
        let mut idle_queue = VecDeque::with_capacity(size);
        for id in 0..size as u64 {
            slots.push(WorkerSlot {
                id,
                state: SlotState::Idle,
                jobs_served: 0,
                consecutive_failures: 0,
                last_used_at: Instant::now(),
                backend: factory(),
            });
            idle_queue.push_back(id);
        }

        Self {
            slots: Mutex::new(slots),
            idle_queue: Mutex::new(idle_queue),
            notify: Notify::new(),
            waiters: std::sync::atomic::AtomicUsize::new(0),
            recycle_after,
            factory,
            next_id: std::sync::atomic::AtomicU64::new(size as u64),
        }
    }

    pub async fn size(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Blocks up to `deadline` for an idle slot, FIFO among waiters.
    pub async fn acquire(&self, deadline: Instant) -> Result<SlotHandle, PoolError> {
        if self.slots.lock().await.is_empty() {
            return Err(PoolError::PoolUnavailable);
        }

        self.waiters.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let result = self.acquire_inner(deadline).await;
        self.waiters.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        result
    }

    async fn acquire_inner(&self, deadline: Instant) -> Result<SlotHandle, PoolError> {
        loop {
            {
                let mut queue = self.idle_queue.lock().await;
                if let Some(id) = queue.pop_front() {
                    drop(queue);
                    let mut slots = self.slots.lock().await;
                    if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
                        slot.state = SlotState::Busy;
                    }
                    return Ok(SlotHandle { id });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::DeadlineExceeded);
            }
            let remaining = deadline - now;
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return Err(PoolError::DeadlineExceeded);
            }
        }
    }

    /// Synchronous recognition on an acquired slot. CPU-bound work runs on
    /// a blocking thread with a 60s wall-clock limit; exceeding it is
    /// treated as a failure and the slot is recycled.
    pub async fn recognize(
        &self,
        handle: &SlotHandle,
        image_path: &Path,
        language: &str,
    ) -> Result<OcrOutput, super::backend::OcrError> {
        let id = handle.id;
        let backend: Arc<dyn OcrBackend> = {
            let slots = self.slots.lock().await;
            let slot = slots.iter().find(|s| s.id == id).expect("slot exists");
            // The slot is Busy and owned exclusively by this handle (per
            // invariant 3), so cloning the Arc here hands the blocking
            // task its own reference without any other caller touching it.
            Arc::clone(&slot.backend)
        };
        let image_path = image_path.to_path_buf();
        let language = language.to_string();

        let result = tokio::time::timeout(
            OCR_WALL_CLOCK_LIMIT,
            tokio::task::spawn_blocking(move || backend.recognize(&image_path, &language)),
        )
        .await;

        match result {
            Ok(Ok(inner)) => {
                self.record_outcome(id, inner.is_ok()).await;
                inner
            }
            Ok(Err(join_err)) => {
                self.record_outcome(id, false).await;
                Err(super::backend::OcrError::RecognitionFailed(format!(
                    "worker task panicked: {join_err}"
                )))
            }
            Err(_timeout) => {
                warn!(slot = id, "OCR recognition exceeded wall-clock limit");
                self.record_outcome(id, false).await;
                Err(super::backend::OcrError::RecognitionFailed(
                    "recognition exceeded 60s wall-clock limit".to_string(),
                ))
            }
        }
    }

    async fn record_outcome(&self, id: u64, success: bool) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
            if success {
                slot.consecutive_failures = 0;
            } else {
                slot.consecutive_failures += 1;
            }
        }
    }

    /// Marks the slot idle, or triggers recycling per the health/job-count
    /// rule, replacing the worker asynchronously off the hot path.
    ///
    /// A single `Outcome::Error` does not by itself force a recycle — that
    /// would mean discarding a long-lived engine instance over one
    /// transient recognition failure. Recycling triggers only once the
    /// slot crosses the three-consecutive-engine-failure "dead" threshold
    /// (tracked by `record_outcome` inside `recognize`) or its job budget.
    pub async fn release(&self, handle: SlotHandle, outcome: Outcome) {
        let id = handle.id;
        let should_recycle = {
            let mut slots = self.slots.lock().await;
            let slot = match slots.iter_mut().find(|s| s.id == id) {
                Some(s) => s,
                None => return,
            };
            slot.jobs_served += 1;
            slot.last_used_at = Instant::now();
            if matches!(outcome, Outcome::Error) {
                debug!(slot = id, "OCR job reported error outcome on release");
            }

            let dead = slot.consecutive_failures >= DEAD_AFTER_CONSECUTIVE_FAILURES;
            let over_budget = self.recycle_after > 0 && slot.jobs_served >= self.recycle_after;
            let recycle = dead || over_budget;

            if recycle {
                slot.state = SlotState::Recycling;
            } else {
                slot.state = SlotState::Idle;
            }
            recycle
        };

        if should_recycle {
            self.spawn_replacement(id).await;
        } else {
            self.idle_queue.lock().await.push_back(id);
            self.notify.notify_one();
        }
    }

    async fn spawn_replacement(&self, id: u64) {
        debug!(slot = id, "recycling OCR worker");
        let new_backend = (self.factory)();
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
            slot.backend = new_backend;
            slot.jobs_served = 0;
            slot.consecutive_failures = 0;
            slot.state = SlotState::Idle;
        }
        drop(slots);
        self.idle_queue.lock().await.push_back(id);
        self.notify.notify_one();
    }

    pub async fn stats(&self) -> PoolStats {
        let slots = self.slots.lock().await;
        let mut stats = PoolStats {
            size: slots.len(),
            waiters: self.waiters.load(std::sync::atomic::Ordering::SeqCst),
            ..Default::default()
        };
        for slot in slots.iter() {
            match slot.state {
                SlotState::Idle => stats.idle += 1,
                SlotState::Busy => stats.busy += 1,
                SlotState::Recycling => stats.recycling += 1,
                SlotState::Dead => {}
            }
        }
        stats
    }

    #[allow(dead_code)]
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::backend::test_support::StubBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn immediate_deadline() -> Instant {
        Instant::now()
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn zero_size_pool_rejects_acquire_immediately() {
        let pool = OcrPool::new(0, 0, || {
            Arc::new(StubBackend {
                available: true,
                text: String::new(),
                confidence: Some(1.0),
                fail: false,
            })
        });
        let result = pool.acquire(far_deadline()).await;
        assert!(matches!(result, Err(PoolError::PoolUnavailable)));
    }

    #[tokio::test]
    async fn acquire_and_release_round_trips() {
        let pool = OcrPool::new(2, 0, || {
            Arc::new(StubBackend {
                available: true,
                text: "hello".to_string(),
                confidence: Some(0.9),
                fail: false,
            })
        });
        let handle = pool.acquire(far_deadline()).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.idle, 1);
        pool.release(handle, Outcome::Success).await;
        let stats = pool.stats().await;
        assert_eq!(stats.idle, 2);
    }

    #[tokio::test]
    async fn acquire_on_exhausted_pool_times_out() {
        let pool = OcrPool::new(1, 0, || {
            Arc::new(StubBackend {
                available: true,
                text: String::new(),
                confidence: Some(1.0),
                fail: false,
            })
        });
        let _handle = pool.acquire(far_deadline()).await.unwrap();
        let result = pool.acquire(immediate_deadline()).await;
        assert!(matches!(result, Err(PoolError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn three_consecutive_failures_marks_slot_for_recycling() {
        let fail_count = Arc::new(AtomicUsize::new(0));
        let fc = fail_count.clone();
        let pool = OcrPool::new(1, 0, move || {
            fc.fetch_add(1, Ordering::SeqCst);
            Arc::new(StubBackend {
                available: true,
                text: String::new(),
                confidence: None,
                fail: true,
            })
        });

        for _ in 0..3 {
            let handle = pool.acquire(far_deadline()).await.unwrap();
            let image = std::path::PathBuf::from("/tmp/does-not-matter.png");
            let result = pool.recognize(&handle, &image, "eng").await;
            assert!(result.is_err());
            pool.release(handle, Outcome::Error).await;
        }

        // Three failures -> recycled -> factory invoked a second time.
        assert_eq!(fail_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recognize_returns_text_on_success() {
        let pool = OcrPool::new(1, 0, || {
            Arc::new(StubBackend {
                available: true,
                text: "recognized text".to_string(),
                confidence: Some(0.8),
                fail: false,
            })
        });
        let handle = pool.acquire(far_deadline()).await.unwrap();
        let image = std::path::PathBuf::from("/tmp/does-not-matter.png");
        let result = pool.recognize(&handle, &image, "eng").await.unwrap();
        assert_eq!(result.text, "recognized text");
        pool.release(handle, Outcome::Success).await;
    }
}
