//! Per-session ledger of temp files and directories (component C).
//!
//! Ownership is scoped to a sessionId, the way 4.F's design notes replace
//! "ad-hoc track-this-file-for-cleanup globals" with an explicit registry:
//! the orchestrator owns the sessionId and asks the registry for release,
//! there is no process-wide mutable set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TempRegistryError {
    #[error("io error creating temp resource: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Image,
    Dir,
    Other,
}

#[derive(Debug, Clone)]
pub struct TempFileEntry {
    pub id: u64,
    pub path: PathBuf,
    pub kind: EntryKind,
    pub session_id: String,
    pub created_at: SystemTime,
    pub size_bytes: u64,
}

/// Outcome of a `releaseBySession`/`sweep` pass: how many entries were
/// removed and how many deletions failed (logged, never propagated).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub released: usize,
    pub failed: usize,
}

pub struct TempRegistry {
    entries: Mutex<HashMap<u64, TempFileEntry>>,
    next_id: AtomicU64,
    max_count: usize,
    max_age_ms: u64,
    max_size_bytes: u64,
}

impl TempRegistry {
    pub fn new(max_count: usize, max_age_ms: u64, max_size_bytes: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_count,
            max_age_ms,
            max_size_bytes,
        }
    }

    /// `generate(base) → base_<unixMillis>_<processId>_<rand36-6>`. Collision
    /// is statistically negligible; `create_dir` retries on the rare
    /// `AlreadyExists` by calling this again.
    pub fn generate_name(base: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let pid = std::process::id();
        let suffix = random_base36(6);
        format!("{base}_{millis}_{pid}_{suffix}")
    }

    /// Allocates a unique directory under `root`, recording it against
    /// `sessionId`.
    pub async fn create_dir(
        &self,
        root: &Path,
        base: &str,
        session_id: &str,
    ) -> Result<PathBuf, TempRegistryError> {
        loop {
            let name = Self::generate_name(base);
            let path = root.join(&name);
            match tokio::fs::create_dir_all(&path).await {
                Ok(()) => {
                    self.register(path.clone(), EntryKind::Dir, session_id, 0)
                        .await;
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(TempRegistryError::Io(e)),
            }
        }
    }

    /// Records an already-created path against a session. Returns the
    /// assigned entry id. `path` must be unique among live entries.
    pub async fn register(
        &self,
        path: PathBuf,
        kind: EntryKind,
        session_id: &str,
        size_bytes: u64,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = TempFileEntry {
            id,
            path,
            kind,
            session_id: session_id.to_string(),
            created_at: SystemTime::now(),
            size_bytes,
        };
        self.entries.lock().await.insert(id, entry);
        id
    }

    /// Number of live entries for a session — used by the invariant check
    /// "at the moment the orchestrator returns, live count is zero".
    pub async fn live_count_for_session(&self, session_id: &str) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|e| e.session_id == session_id)
            .count()
    }

    /// Removes every live entry for `session_id`, recursively for directory
    /// entries, in parallel with per-entry error isolation: one failure
    /// does not stop the others. Idempotent — a second call on an already
    /// empty session performs no filesystem operations.
    pub async fn release_by_session(&self, session_id: &str) -> ReleaseOutcome {
        let doomed: Vec<TempFileEntry> = {
            let mut entries = self.entries.lock().await;
            let ids: Vec<u64> = entries
                .iter()
                .filter(|(_, e)| e.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        if doomed.is_empty() {
            return ReleaseOutcome::default();
        }

        let results = futures_join_all(doomed.iter().cloned().map(delete_entry)).await;
        let failed = results.iter().filter(|ok| !**ok).count();
        ReleaseOutcome {
            released: doomed.len() - failed,
            failed,
        }
    }

    pub async fn release_by_id(&self, id: u64) -> bool {
        let entry = self.entries.lock().await.remove(&id);
        match entry {
            Some(entry) => delete_entry(entry).await,
            None => true,
        }
    }

    /// Evicts entries older than `maxAgeMs`; if count or total size
    /// exceeds caps, evicts oldest-first until under both.
    pub async fn sweep(&self) -> ReleaseOutcome {
        let now = SystemTime::now();
        let expired: Vec<u64> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|(_, e)| {
                    now.duration_since(e.created_at)
                        .unwrap_or(Duration::ZERO)
                        .as_millis() as u64
                        >= self.max_age_ms
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let mut outcome = ReleaseOutcome::default();
        for id in expired {
            if self.release_by_id(id).await {
                outcome.released += 1;
            } else {
                outcome.failed += 1;
            }
        }

        loop {
            let (count, total_size) = {
                let entries = self.entries.lock().await;
                (
                    entries.len(),
                    entries.values().map(|e| e.size_bytes).sum::<u64>(),
                )
            };
            if count <= self.max_count && total_size <= self.max_size_bytes {
                break;
            }
            let oldest = {
                let entries = self.entries.lock().await;
                entries
                    .values()
                    .min_by_key(|e| e.created_at)
                    .map(|e| e.id)
            };
            match oldest {
                Some(id) => {
                    if self.release_by_id(id).await {
                        outcome.released += 1;
                    } else {
                        outcome.failed += 1;
                    }
                }
                None => break,
            }
        }

        outcome
    }

    /// Sweeps every live entry, then the caller stops scheduling further
    /// background sweeps.
    pub async fn close(&self) -> ReleaseOutcome {
        let all_ids: Vec<u64> = self.entries.lock().await.keys().copied().collect();
        let mut outcome = ReleaseOutcome::default();
        for id in all_ids {
            if self.release_by_id(id).await {
                outcome.released += 1;
            } else {
                outcome.failed += 1;
            }
        }
        outcome
    }
}

async fn delete_entry(entry: TempFileEntry) -> bool {
    let result = match entry.kind {
        EntryKind::Dir => tokio::fs::remove_dir_all(&entry.path).await,
        EntryKind::Image | EntryKind::Other => tokio::fs::remove_file(&entry.path).await,
    };
    match result {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %entry.path.display(), error = %e, "temp entry deletion failed");
            false
        }
    }
}

/// Small local stand-in for `futures::future::join_all` scoped to this
/// module — avoids pulling the whole `futures` crate in for one call site.
async fn futures_join_all<F>(iter: impl Iterator<Item = F>) -> Vec<bool>
where
    F: std::future::Future<Output = bool> + Send + 'static,
{
    let mut out = Vec::new();
    let handles: Vec<_> = iter.map(tokio::spawn).collect();
    for h in handles {
        out.push(h.await.unwrap_or(false));
    }
    out
}

fn random_base36(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_dir_registers_and_is_unique() {
        let root = tempdir().unwrap();
        let registry = TempRegistry::new(100, 3_600_000, 500 * 1024 * 1024);
        let a = registry.create_dir(root.path(), "sess", "s1").await.unwrap();
        let b = registry.create_dir(root.path(), "sess", "s1").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.live_count_for_session("s1").await, 2);
    }

    #[tokio::test]
    async fn release_by_session_is_idempotent() {
        let root = tempdir().unwrap();
        let registry = TempRegistry::new(100, 3_600_000, 500 * 1024 * 1024);
        registry.create_dir(root.path(), "sess", "s1").await.unwrap();
        let first = registry.release_by_session("s1").await;
        assert_eq!(first.released, 1);
        let second = registry.release_by_session("s1").await;
        assert_eq!(second, ReleaseOutcome::default());
        assert_eq!(registry.live_count_for_session("s1").await, 0);
    }

    #[tokio::test]
    async fn sweep_evicts_expired_entries() {
        let root = tempdir().unwrap();
        let registry = TempRegistry::new(100, 0, 500 * 1024 * 1024);
        registry.create_dir(root.path(), "sess", "s1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let outcome = registry.sweep().await;
        assert_eq!(outcome.released, 1);
        assert_eq!(registry.live_count_for_session("s1").await, 0);
    }

    #[tokio::test]
    async fn sweep_enforces_count_cap_oldest_first() {
        let root = tempdir().unwrap();
        let registry = TempRegistry::new(1, 3_600_000, 500 * 1024 * 1024);
        registry.create_dir(root.path(), "a", "s1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        registry.create_dir(root.path(), "b", "s1").await.unwrap();
        let outcome = registry.sweep().await;
        assert_eq!(outcome.released, 1);
        assert_eq!(registry.live_count_for_session("s1").await, 1);
    }

    #[tokio::test]
    async fn close_sweeps_all_sessions() {
        let root = tempdir().unwrap();
        let registry = TempRegistry::new(100, 3_600_000, 500 * 1024 * 1024);
        registry.create_dir(root.path(), "a", "s1").await.unwrap();
        registry.create_dir(root.path(), "b", "s2").await.unwrap();
        let outcome = registry.close().await;
        assert_eq!(outcome.released, 2);
    }
}
