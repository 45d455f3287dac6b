use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use crate::metrics::{CACHE_HITS, CACHE_MISSES, CACHE_SIZE};

// Longest TTL we honour, keeps Instant arithmetic in range
const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

// Who an entry belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Global,
    User(String),
}

// Fully-qualified cache key. Global and per-user entries never share a slot,
// even when the logical key text happens to look like "user:key".
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub scope: CacheScope,
    pub logical: String,
}

impl CacheKey {
    pub fn global(logical: impl Into<String>) -> Self {
        Self {
            scope: CacheScope::Global,
            logical: logical.into(),
        }
    }

    pub fn user(user_id: impl Into<String>, logical: impl Into<String>) -> Self {
        Self {
            scope: CacheScope::User(user_id.into()),
            logical: logical.into(),
        }
    }

    pub fn scoped(logical: &str, user_id: Option<&str>) -> Self {
        match user_id {
            Some(user) => Self::user(user, logical),
            None => Self::global(logical),
        }
    }

    pub fn belongs_to(&self, user_id: &str) -> bool {
        matches!(&self.scope, CacheScope::User(u) if u == user_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            CacheScope::Global => write!(f, "{}", self.logical),
            CacheScope::User(user) => write!(f, "{}:{}", user, self.logical),
        }
    }
}

// Logical key for a normalized query (sha256, same as the gateway keyed prompts)
pub fn fingerprint(normalized_query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    format!("query:{:x}", hasher.finalize())
}

// Cache entry with expiry
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub value: Value,
    pub expires_at: Instant,
    pub size_bytes: usize,
}

impl CacheEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        let size_bytes = value.to_string().len();
        Self {
            value,
            expires_at: Instant::now() + ttl.min(MAX_TTL),
            size_bytes,
        }
    }

    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

// Options for the awaiting write path
#[derive(Clone, Debug)]
pub struct SetOptions {
    pub ttl_seconds: f64,
    pub user_id: Option<String>,
}

impl SetOptions {
    pub fn ttl(ttl_seconds: f64) -> Self {
        Self {
            ttl_seconds,
            user_id: None,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

// Negative, NaN or zero TTLs produce an entry that is already expired
fn ttl_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(MAX_TTL)
    } else {
        Duration::ZERO
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub user_specific_entries: usize,
    pub keys: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub status: HealthStatus,
    pub hit_rate: f64,
    pub size: usize,
    pub memory_usage: usize,
}

/// Limits used by [`ResponseCache::health`].
///
/// The hit rate is only judged once `min_lookups` gets have been served, so a
/// cold cache does not report itself as degraded.
#[derive(Clone, Debug)]
pub struct HealthThresholds {
    pub min_lookups: u64,
    pub degraded_hit_rate: f64,
    pub unhealthy_hit_rate: f64,
    pub degraded_size: usize,
    pub unhealthy_size: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_lookups: 20,
            degraded_hit_rate: 0.3,
            unhealthy_hit_rate: 0.1,
            degraded_size: 5_000,
            unhealthy_size: 20_000,
        }
    }
}

impl HealthThresholds {
    pub fn classify(&self, hit_rate: f64, lookups: u64, size: usize) -> HealthStatus {
        let by_size = if size >= self.unhealthy_size {
            HealthStatus::Unhealthy
        } else if size >= self.degraded_size {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let by_hit_rate = if lookups < self.min_lookups {
            HealthStatus::Healthy
        } else if hit_rate < self.unhealthy_hit_rate {
            HealthStatus::Unhealthy
        } else if hit_rate < self.degraded_hit_rate {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        by_size.max(by_hit_rate)
    }
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub sweep_interval: Duration,
    pub thresholds: HealthThresholds,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            thresholds: HealthThresholds::default(),
        }
    }
}

/// In-memory response cache with per-entry TTL and per-user namespaces.
///
/// Expired entries are dropped lazily on `get` and by the optional background
/// sweeper started with [`ResponseCache::start_sweeper`].
pub struct ResponseCache {
    entries: Arc<DashMap<CacheKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    config: CacheConfig,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            config,
            sweeper: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn get(&self, key: &str, user_id: Option<&str>) -> Option<Value> {
        if self.is_disposed() {
            self.record_miss();
            return None;
        }

        let cache_key = CacheKey::scoped(key, user_id);
        let now = Instant::now();

        let (found, expired) = match self.entries.get(&cache_key) {
            Some(entry) if entry.is_live(now) => (Some(entry.value.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };

        if expired {
            self.entries.remove_if(&cache_key, |_, entry| !entry.is_live(now));
            CACHE_SIZE.set(self.entries.len() as f64);
        }

        match found {
            Some(value) if !value.is_null() => {
                self.record_hit();
                Some(value)
            }
            _ => {
                self.record_miss();
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, options: SetOptions) {
        let cache_key = CacheKey::scoped(key, options.user_id.as_deref());
        self.insert(cache_key, value, ttl_duration(options.ttl_seconds));
    }

    pub fn set_sync(&self, key: &str, value: Value, ttl_seconds: f64) {
        self.insert(CacheKey::global(key), value, ttl_duration(ttl_seconds));
    }

    fn insert(&self, key: CacheKey, value: Value, ttl: Duration) {
        if self.is_disposed() {
            warn!(key = %key, "write to disposed cache ignored");
            return;
        }
        self.entries.insert(key, CacheEntry::new(value, ttl));
        CACHE_SIZE.set(self.entries.len() as f64);
    }

    pub fn remove(&self, key: &str, user_id: Option<&str>) -> bool {
        let removed = self.entries.remove(&CacheKey::scoped(key, user_id)).is_some();
        CACHE_SIZE.set(self.entries.len() as f64);
        removed
    }

    // Drop every entry owned by one user, returns how many went
    pub fn clear_user(&self, user_id: &str) -> usize {
        let mut removed = 0;
        self.entries.retain(|key, _| {
            let owned = key.belongs_to(user_id);
            if owned {
                removed += 1;
            }
            !owned
        });
        CACHE_SIZE.set(self.entries.len() as f64);
        debug!(user_id, removed, "cleared user cache");
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        CACHE_SIZE.set(0.0);
    }

    pub fn purge_expired(&self) -> usize {
        purge(&self.entries)
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut keys = Vec::new();
        let mut user_specific_entries = 0;

        for entry in self.entries.iter().filter(|e| e.value().is_live(now)) {
            if matches!(entry.key().scope, CacheScope::User(_)) {
                user_specific_entries += 1;
            }
            keys.push(entry.key().to_string());
        }
        keys.sort();

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        CacheStats {
            size: keys.len(),
            hits,
            misses,
            hit_rate: hit_rate(hits, misses),
            user_specific_entries,
            keys,
        }
    }

    pub fn health(&self) -> CacheHealth {
        let now = Instant::now();
        let (size, memory_usage) = self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now))
            .fold((0, 0), |(count, bytes), e| {
                (count + 1, bytes + e.key().to_string().len() + e.value().size_bytes)
            });

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let rate = hit_rate(hits, misses);

        CacheHealth {
            status: self.config.thresholds.classify(rate, hits + misses, size),
            hit_rate: rate,
            size,
            memory_usage,
        }
    }

    /// Spawn the periodic expiry sweep on the current tokio runtime.
    ///
    /// Does nothing when called outside a runtime, after `dispose()`, or when
    /// a sweeper is already running.
    pub fn start_sweeper(&self) {
        if self.is_disposed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, cache sweeper not started");
            return;
        };

        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let entries = Arc::clone(&self.entries);
        let every = self.config.sweep_interval.max(Duration::from_millis(10));

        *slot = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = purge(&entries);
                if purged > 0 {
                    debug!(purged, "swept expired cache entries");
                }
            }
        }));
        debug!(interval = ?every, "cache sweeper started");
    }

    // Stop the sweeper and drop all entries. Later calls are safe no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.entries.clear();
        CACHE_SIZE.set(0.0);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        CACHE_HITS.inc();
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        CACHE_MISSES.inc();
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn purge(entries: &DashMap<CacheKey, CacheEntry>) -> usize {
    let now = Instant::now();
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    let after = entries.len();
    CACHE_SIZE.set(after as f64);
    before.saturating_sub(after)
}
