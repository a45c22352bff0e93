//! Bounded LRU cache of terminal command outcomes, keyed by command id.
//!
//! Every terminal outcome is stored here so a caller that polls
//! [`crate::queue::QueueService::await_result`] after a command has already
//! finished still gets the answer, and so a second lookup (e.g. from an
//! external event sink) doesn't need to replay the executor. See spec
//! §3/§4.3.
//!
//! Built on the `lru` crate the way [`crate::cache`]'s sibling components in
//! the wider Rust ecosystem do: `LruCache::get` already promotes an entry to
//! most-recently-used on touch, so its internal ordering *is* "ascending
//! `last_access`" as long as every touch updates both. We give it an
//! effectively unbounded capacity and do our own byte/entry/pressure
//! admission control, since the crate's capacity knob is count-only.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;

/// A cached terminal outcome for one command.
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub ok: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration: std::time::Duration,
    pub data: HashMap<String, String>,
    pub created_at: Instant,
    pub last_access: Instant,
}

impl CachedResult {
    #[must_use]
    pub fn success(output: String, duration: std::time::Duration) -> Self {
        let now = Instant::now();
        Self {
            ok: true,
            output,
            error: None,
            duration,
            data: HashMap::new(),
            created_at: now,
            last_access: now,
        }
    }

    #[must_use]
    pub fn failure(error: String, duration: std::time::Duration) -> Self {
        let now = Instant::now();
        Self {
            ok: false,
            output: String::new(),
            error: Some(error),
            duration,
            data: HashMap::new(),
            created_at: now,
            last_access: now,
        }
    }

    /// `base + 2*len(output) + 2*len(error) + 50*entries(data)`, in bytes
    /// (spec §3). The estimator is intentionally rough — only monotone in
    /// payload size, never exact.
    #[must_use]
    fn estimated_size(&self) -> usize {
        const BASE: usize = 128;
        const PER_DATA_ENTRY: usize = 50;
        BASE
            + 2 * self.output.len()
            + 2 * self.error.as_deref().map_or(0, str::len)
            + PER_DATA_ENTRY * self.data.len()
    }
}

/// Snapshot of cache occupancy for diagnostics/stats logging.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub max_bytes: usize,
    pub max_entries: usize,
    pub usage_pct: f64,
}

struct Inner {
    map: LruCache<String, CachedResult>,
    current_bytes: usize,
}

/// Thread-safe bounded LRU store. `store`/`remove`/eviction share one mutex;
/// `get` takes the same mutex only to update `last_access`, which is a
/// single-entry write, not a scan — contention stays low.
pub struct ResultCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
    max_entries: usize,
    pressure: f64,
}

impl ResultCache {
    #[must_use]
    pub fn new(max_bytes: usize, max_entries: usize, pressure: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::new(NonZeroUsize::new(usize::MAX).expect("nonzero")),
                current_bytes: 0,
            }),
            max_bytes,
            max_entries,
            pressure,
        }
    }

    /// Admit `result` under `id`. Idempotent: replacing an existing entry
    /// adjusts `current_bytes` by the size delta rather than double-counting.
    pub fn store(&self, id: String, result: CachedResult) {
        let new_size = result.estimated_size();
        let mut inner = self.inner.lock();

        let old_size = inner.map.peek(&id).map(CachedResult::estimated_size);
        let projected = inner.current_bytes.saturating_sub(old_size.unwrap_or(0)) + new_size;
        let effective_entries = if old_size.is_some() {
            inner.map.len()
        } else {
            inner.map.len() + 1
        };

        if (projected as f64) > (self.max_bytes as f64) * self.pressure
            || effective_entries > self.max_entries
        {
            let batch = std::cmp::max(1, inner.map.len().div_ceil(4));
            for _ in 0..batch {
                if let Some((_evicted_id, evicted)) = inner.map.pop_lru() {
                    inner.current_bytes = inner.current_bytes.saturating_sub(evicted.estimated_size());
                } else {
                    break;
                }
            }
        }

        if let Some(old) = old_size {
            inner.current_bytes = inner.current_bytes.saturating_sub(old);
        }
        inner.current_bytes += new_size;
        inner.map.put(id, result);
    }

    /// Look up `id`, refreshing its `last_access` on hit.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<CachedResult> {
        let mut inner = self.inner.lock();
        let entry = inner.map.get_mut(id)?;
        entry.last_access = Instant::now();
        Some(entry.clone())
    }

    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.inner.lock().map.contains(id)
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.inner.lock();
        if let Some(result) = inner.map.pop(id) {
            inner.current_bytes = inner.current_bytes.saturating_sub(result.estimated_size());
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.current_bytes = 0;
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let usage_pct = if self.max_bytes == 0 {
            0.0
        } else {
            (inner.current_bytes as f64 / self.max_bytes as f64) * 100.0
        };
        CacheStats {
            entries: inner.map.len(),
            bytes: inner.current_bytes,
            max_bytes: self.max_bytes,
            max_entries: self.max_entries,
            usage_pct,
        }
    }
}
