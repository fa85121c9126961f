//! Local signal cache
//!
//! A thread-safe queue of signals waiting to be delivered. There is no
//! guarantee that signals come out in the order they went in; every signal
//! carries its own `receivedAt` timestamp, which lets the server reorder
//! them.
//!
//! The cache is backed up to a single JSON file at shutdown and restored
//! (then deleted) on the next start, so signals survive process restarts.
//!
//! ```rust,no_run
//! use signalpost_core::{SignalCache, SignalRecord};
//!
//! let cache: SignalCache<SignalRecord> = SignalCache::load("/tmp/signal-cache.json");
//! let batch = cache.pop();
//! // ... try to send `batch`; on failure:
//! cache.push_many(batch);
//! cache.backup().expect("failed to back up signals");
//! ```

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Largest batch `pop` hands out
pub const MAX_BATCH_SIZE: usize = 100;

/// Thread-safe signal queue with file backup
pub struct SignalCache<T> {
    queue: Mutex<VecDeque<T>>,
    path: Option<PathBuf>,
}

impl<T> SignalCache<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Create a cache backed by `path`, restoring any previous backup
    ///
    /// A backup file is consumed: it is deleted once read so the same
    /// signals are never loaded twice. A missing or corrupt file yields an
    /// empty cache; loading never fails.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        tracing::debug!(path = %path.display(), "Loading signal cache");

        let restored = match fs::read_to_string(&path) {
            Ok(data) => {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to delete signal cache backup after reading"
                    );
                }
                match serde_json::from_str::<Vec<T>>(&data) {
                    Ok(items) => {
                        tracing::info!(count = items.len(), "Restored signals from backup");
                        VecDeque::from(items)
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Discarding unreadable signal cache backup"
                        );
                        VecDeque::new()
                    }
                }
            }
            Err(e) => {
                // Nothing saved yet, or already loaded
                tracing::debug!(error = %e, "No signal cache backup to restore");
                VecDeque::new()
            }
        };

        Self {
            queue: Mutex::new(restored),
            path: Some(path),
        }
    }

    /// Create a cache with no backing file
    pub fn in_memory() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            path: None,
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<T>> {
        // A panic while holding the lock can't leave the deque half-updated
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of cached signals
    pub fn count(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Insert a signal
    pub fn push(&self, item: T) {
        self.queue().push_back(item);
    }

    /// Insert a number of signals
    pub fn push_many(&self, items: impl IntoIterator<Item = T>) {
        self.queue().extend(items);
    }

    /// Remove up to [`MAX_BATCH_SIZE`] signals and return them
    ///
    /// Hold on to the returned signals. If whatever you do with them fails
    /// (e.g. sending them to a server), put them back with
    /// [`push_many`](Self::push_many).
    pub fn pop(&self) -> Vec<T> {
        self.pop_up_to(MAX_BATCH_SIZE)
    }

    /// Like [`pop`](Self::pop) with a smaller ceiling, clamped to
    /// `1..=MAX_BATCH_SIZE`
    pub fn pop_up_to(&self, limit: usize) -> Vec<T> {
        let limit = limit.clamp(1, MAX_BATCH_SIZE);
        let mut queue = self.queue();
        let take = limit.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Save the entire cache to disk and clear it
    ///
    /// The JSON array is written to a sibling temp file and renamed over the
    /// backup path. The in-memory queue is cleared only after the rename
    /// succeeds; on error every signal stays cached. Returns the number of
    /// signals written. A cache without a backing file writes nothing.
    pub fn backup(&self) -> Result<usize> {
        let mut queue = self.queue();
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let data = serde_json::to_vec(&*queue)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = tmp_path_for(path);
        if let Err(e) = fs::write(&tmp_path, &data).and_then(|_| fs::rename(&tmp_path, path)) {
            let _ = fs::remove_file(&tmp_path);
            tracing::error!(
                path = %path.display(),
                error = %e,
                "Error while saving signal cache"
            );
            return Err(e.into());
        }

        let count = queue.len();
        queue.clear();
        tracing::info!(path = %path.display(), count, "Saved signal cache");
        Ok(count)
    }
}

/// `signal-cache.json` -> `signal-cache.json.tmp`
fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Count the signals in a backup file without consuming it
pub fn peek_backup(path: &Path) -> Result<usize> {
    let data = fs::read_to_string(path)?;
    let items: Vec<serde_json::Value> = serde_json::from_str(&data)?;
    Ok(items.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn cache_in(dir: &TempDir) -> SignalCache<u32> {
        SignalCache::load(dir.path().join("signal-cache.json"))
    }

    #[test]
    fn test_pop_empty_returns_empty() {
        let cache: SignalCache<u32> = SignalCache::in_memory();
        assert!(cache.pop().is_empty());
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_pop_bounded_by_max_batch_size() {
        let cache = SignalCache::in_memory();
        cache.push_many(0..250u32);

        assert_eq!(cache.pop().len(), MAX_BATCH_SIZE);
        assert_eq!(cache.pop().len(), MAX_BATCH_SIZE);
        assert_eq!(cache.pop().len(), 50);
        assert!(cache.pop().is_empty());
    }

    #[test]
    fn test_pop_up_to_clamps() {
        let cache = SignalCache::in_memory();
        cache.push_many(0..300u32);

        assert_eq!(cache.pop_up_to(10).len(), 10);
        assert_eq!(cache.pop_up_to(0).len(), 1);
        assert_eq!(cache.pop_up_to(1_000).len(), MAX_BATCH_SIZE);
        assert_eq!(cache.count(), 189);
    }

    #[test]
    fn test_push_then_pop_keeps_items() {
        let cache = SignalCache::in_memory();
        cache.push(1u32);
        cache.push_many(vec![2, 3]);

        let mut popped = cache.pop();
        popped.sort();
        assert_eq!(popped, vec![1, 2, 3]);
    }

    #[test]
    fn test_concurrent_count_consistency() {
        let cache = Arc::new(SignalCache::in_memory());
        let popped = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let popped = Arc::clone(&popped);
                std::thread::spawn(move || {
                    for n in 0..500u32 {
                        cache.push(n);
                        if (n + i) % 7 == 0 {
                            let batch = cache.pop_up_to(3);
                            popped.fetch_add(batch.len(), std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let popped = popped.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(cache.count(), 8 * 500 - popped);
    }

    #[test]
    fn test_backup_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        cache.push_many(vec![5u32, 1, 5, 9]);

        assert_eq!(cache.backup().unwrap(), 4);
        assert_eq!(cache.count(), 0);
        assert!(dir.path().join("signal-cache.json").exists());
        assert!(!dir.path().join("signal-cache.json.tmp").exists());

        let restored = cache_in(&dir);
        let mut items = restored.pop();
        items.sort();
        assert_eq!(items, vec![1, 5, 5, 9]);
    }

    #[test]
    fn test_load_consumes_backup_once() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        cache.push_many(vec![1u32, 2, 3]);
        cache.backup().unwrap();

        let first = cache_in(&dir);
        assert_eq!(first.count(), 3);
        assert!(!dir.path().join("signal-cache.json").exists());

        let second = cache_in(&dir);
        assert_eq!(second.count(), 0);
    }

    #[test]
    fn test_load_corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("signal-cache.json");
        fs::write(&path, "{ not json").unwrap();

        let cache: SignalCache<u32> = SignalCache::load(&path);
        assert_eq!(cache.count(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_backup_failure_keeps_items() {
        let dir = TempDir::new().unwrap();
        // A directory where the backup file should go makes the rename fail
        let path = dir.path().join("signal-cache.json");
        fs::create_dir_all(path.join("occupied")).unwrap();

        let cache: SignalCache<u32> = SignalCache::load(&path);
        cache.push_many(vec![1, 2, 3]);

        assert!(cache.backup().is_err());
        assert_eq!(cache.count(), 3);
        assert!(!dir.path().join("signal-cache.json.tmp").exists());
    }

    #[test]
    fn test_backup_empty_writes_empty_array() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);

        assert_eq!(cache.backup().unwrap(), 0);
        let data = fs::read_to_string(dir.path().join("signal-cache.json")).unwrap();
        assert_eq!(data, "[]");
    }

    #[test]
    fn test_in_memory_backup_is_noop() {
        let cache = SignalCache::in_memory();
        cache.push(1u32);
        assert_eq!(cache.backup().unwrap(), 0);
        assert_eq!(cache.count(), 1);
        assert!(cache.path().is_none());
    }

    #[test]
    fn test_peek_backup_does_not_consume() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        cache.push_many(vec![1u32, 2]);
        cache.backup().unwrap();

        let path = dir.path().join("signal-cache.json");
        assert_eq!(peek_backup(&path).unwrap(), 2);
        assert!(path.exists());
        assert!(peek_backup(&dir.path().join("missing.json")).is_err());
    }
}
