//! Key-value backing store abstraction.
//!
//! The medium offers only single-key get/set/remove plus key enumeration. No
//! operation here is atomic across keys.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BackendError {
    #[error("storage quota exceeded while writing {key}")]
    QuotaExceeded { key: String },
    #[error("storage backend failure: {0}")]
    Io(String),
}

/// Durable, synchronous, string-keyed storage.
pub trait KeyValueBackend {
    /// # Errors
    /// Returns an error when the medium cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// # Errors
    /// Returns [`BackendError::QuotaExceeded`] when the medium is full, or
    /// another error when the write fails.
    fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Removing an absent key is not an error.
    ///
    /// # Errors
    /// Returns an error when the medium cannot be written.
    fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// # Errors
    /// Returns an error when the medium cannot be enumerated.
    fn keys(&self) -> Result<Vec<String>, BackendError>;

    /// # Errors
    /// Returns an error when the medium cannot be enumerated.
    fn is_empty(&self) -> Result<bool, BackendError> {
        Ok(self.keys()?.is_empty())
    }

    /// Keys starting with `prefix`, sorted.
    ///
    /// # Errors
    /// Returns an error when the medium cannot be enumerated.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut keys = self.keys()?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

impl<T: KeyValueBackend + ?Sized> KeyValueBackend for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        (**self).remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        (**self).keys()
    }

    fn is_empty(&self) -> Result<bool, BackendError> {
        (**self).is_empty()
    }
}

/// Counts of backend calls, for asserting that a code path stayed read-only.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct AccessStats {
    pub reads: usize,
    pub writes: usize,
    pub removes: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<String, String>,
    quota_bytes: Option<usize>,
    writes_before_failure: Option<usize>,
    removes_before_failure: Option<usize>,
    stats: AccessStats,
}

impl MemoryState {
    fn used_bytes_without(&self, key: &str) -> usize {
        self.entries
            .iter()
            .filter(|(existing, _)| existing.as_str() != key)
            .map(|(existing, value)| existing.len() + value.len())
            .sum()
    }
}

/// In-memory backing store with an optional byte quota and write-failure
/// injection. Shared handles observe each other's writes immediately.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let state = MemoryState {
            entries: entries.into_iter().map(|(key, value)| (key.into(), value.into())).collect(),
            ..MemoryState::default()
        };
        Self { state: Mutex::new(state) }
    }

    /// Cap the total size of keys plus values, like a browser origin quota.
    ///
    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn with_quota(mut self, quota_bytes: usize) -> Result<Self, BackendError> {
        self.state.get_mut().map_err(|_| poisoned())?.quota_bytes = Some(quota_bytes);
        Ok(self)
    }

    /// Let `writes` more `set` calls succeed, then fail every later one until
    /// [`MemoryBackend::clear_write_failure`] is called.
    ///
    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn fail_writes_after(&self, writes: usize) -> Result<(), BackendError> {
        self.lock()?.writes_before_failure = Some(writes);
        Ok(())
    }

    /// Same as [`MemoryBackend::fail_writes_after`], for `remove` calls.
    ///
    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn fail_removes_after(&self, removes: usize) -> Result<(), BackendError> {
        self.lock()?.removes_before_failure = Some(removes);
        Ok(())
    }

    /// Stop injecting failures into both `set` and `remove`.
    ///
    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn clear_write_failure(&self) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        state.writes_before_failure = None;
        state.removes_before_failure = None;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn snapshot(&self) -> Result<BTreeMap<String, String>, BackendError> {
        Ok(self.lock()?.entries.clone())
    }

    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn stats(&self) -> Result<AccessStats, BackendError> {
        Ok(self.lock()?.stats)
    }

    /// # Errors
    /// Returns an error if the internal lock is poisoned.
    pub fn reset_stats(&self) -> Result<(), BackendError> {
        self.lock()?.stats = AccessStats::default();
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BackendError> {
        self.state.lock().map_err(|_| poisoned())
    }
}

fn poisoned() -> BackendError {
    BackendError::Io("memory backend lock poisoned".to_string())
}

fn take_budget(budget: &mut Option<usize>) -> bool {
    match budget {
        Some(0) => false,
        Some(remaining) => {
            *remaining -= 1;
            true
        }
        None => true,
    }
}

impl KeyValueBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut state = self.lock()?;
        state.stats.reads += 1;
        Ok(state.entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        if !take_budget(&mut state.writes_before_failure) {
            return Err(BackendError::Io(format!("injected write failure for {key}")));
        }
        if let Some(quota) = state.quota_bytes {
            let needed = state.used_bytes_without(key) + key.len() + value.len();
            if needed > quota {
                return Err(BackendError::QuotaExceeded { key: key.to_string() });
            }
        }
        state.stats.writes += 1;
        state.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        let mut state = self.lock()?;
        if !take_budget(&mut state.removes_before_failure) {
            return Err(BackendError::Io(format!("injected remove failure for {key}")));
        }
        state.stats.removes += 1;
        state.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        let mut state = self.lock()?;
        state.stats.reads += 1;
        Ok(state.entries.keys().cloned().collect())
    }

    fn is_empty(&self) -> Result<bool, BackendError> {
        let mut state = self.lock()?;
        state.stats.reads += 1;
        Ok(state.entries.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_round_trips_and_enumerates() -> Result<(), BackendError> {
        let backend = MemoryBackend::new();
        assert!(backend.is_empty()?);
        backend.set("ltn/projects/b", "2")?;
        backend.set("ltn/projects/a", "1")?;
        backend.set("other", "3")?;

        assert_eq!(backend.get("ltn/projects/a")?.as_deref(), Some("1"));
        assert_eq!(backend.get("missing")?, None);
        assert_eq!(backend.keys_with_prefix("ltn/projects/")?, vec!["ltn/projects/a", "ltn/projects/b"]);

        backend.remove("other")?;
        backend.remove("other")?;
        assert_eq!(backend.keys()?.len(), 2);
        Ok(())
    }

    #[test]
    fn quota_rejects_oversized_writes_but_allows_replacement() -> Result<(), BackendError> {
        let backend = MemoryBackend::new().with_quota(10)?;
        backend.set("k", "12345")?;
        backend.set("k", "123456789")?;
        assert_eq!(
            backend.set("k2", "1"),
            Err(BackendError::QuotaExceeded { key: "k2".to_string() })
        );
        assert_eq!(backend.get("k")?.as_deref(), Some("123456789"));
        Ok(())
    }

    #[test]
    fn injected_failures_trip_after_budget_and_clear() -> Result<(), BackendError> {
        let backend = MemoryBackend::new();
        backend.fail_writes_after(1)?;
        backend.set("a", "1")?;
        assert!(matches!(backend.set("b", "2"), Err(BackendError::Io(_))));
        assert_eq!(backend.get("b")?, None);

        backend.clear_write_failure()?;
        backend.set("b", "2")?;
        assert_eq!(backend.stats()?.writes, 2);
        Ok(())
    }

    #[test]
    fn injected_remove_failures_keep_the_entry() -> Result<(), BackendError> {
        let backend = MemoryBackend::with_entries([("a", "1"), ("b", "2")]);
        backend.fail_removes_after(1)?;
        backend.remove("a")?;
        assert!(matches!(backend.remove("b"), Err(BackendError::Io(_))));
        assert_eq!(backend.get("b")?.as_deref(), Some("2"));
        backend.set("c", "3")?;

        backend.clear_write_failure()?;
        backend.remove("b")?;
        assert_eq!(backend.keys()?, vec!["c"]);
        Ok(())
    }

    #[test]
    fn quota_builder_reports_a_poisoned_lock() {
        let backend = MemoryBackend::new();
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = backend.state.lock();
            panic!("poison the lock");
        }));
        assert!(poisoned.is_err());
        assert!(matches!(backend.with_quota(10), Err(BackendError::Io(_))));
    }

    #[test]
    fn shared_handles_see_each_other() -> Result<(), BackendError> {
        let backend = Arc::new(MemoryBackend::new());
        let other_tab = Arc::clone(&backend);
        backend.set("k", "v")?;
        assert_eq!(other_tab.get("k")?.as_deref(), Some("v"));
        Ok(())
    }
}
