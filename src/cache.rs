use serde::Serialize;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::metrics::CacheMetrics;

/// Deterministic key of one memoized computation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    function: &'static str,
    digest: String,
}

impl CacheKey {
    /// Hash of the source signature, the function name and the canonical JSON of its arguments
    pub fn new<A: Serialize + ?Sized>(signature: &str, function: &'static str, args: &A) -> Result<Self> {
        let args = serde_json::to_string(args)?;
        let mut s = String::with_capacity(signature.len() + function.len() + args.len() + 2);
        s.push_str(signature);
        s.push('|');
        s.push_str(function);
        s.push('|');
        s.push_str(&args);

        let mut hasher = Sha256::new();
        hasher.update(s.as_bytes());
        Ok(Self {
            function,
            digest: hex::encode(hasher.finalize()),
        })
    }

    pub fn function(&self) -> &'static str {
        self.function
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.function, &self.digest[..12.min(self.digest.len())])
    }
}

type Entry = Arc<dyn Any + Send + Sync>;

fn poisoned<T>(_: PoisonError<T>) -> PipelineError {
    PipelineError::Config("cache lock poisoned by a panicking computation".to_string())
}

/// Process-scoped memo table shared by every query.
///
/// Reads take a shared lock; a miss takes the compute gate, so a key is
/// computed at most once until the source signature changes.
#[derive(Default)]
pub struct PipelineCache {
    signature: RwLock<Option<String>>,
    entries: RwLock<HashMap<CacheKey, Entry>>,
    compute_gate: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("entries", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current source signature, dropping every entry if it changed
    pub fn ensure_signature(&self, fingerprint: &str) -> Result<()> {
        {
            let current = self.signature.read().map_err(poisoned)?;
            if current.as_deref() == Some(fingerprint) {
                return Ok(());
            }
        }
        let mut current = self.signature.write().map_err(poisoned)?;
        if current.as_deref() != Some(fingerprint) {
            if current.is_some() {
                info!("Source signature changed, invalidating cache");
            }
            self.clear()?;
            *current = Some(fingerprint.to_string());
        }
        Ok(())
    }

    /// Drop every entry
    pub fn invalidate_all(&self) -> Result<()> {
        self.clear()?;
        *self.signature.write().map_err(poisoned)? = None;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let evicted = entries.len();
        entries.clear();
        CacheMetrics::record_invalidation(evicted);
        Ok(())
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &CacheKey) -> Result<Option<Arc<T>>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned().and_then(|e| e.downcast::<T>().ok()))
    }

    /// Return the memoized value for `key`, computing it on the first request.
    ///
    /// `compute` must not call back into this cache; resolve dependencies first.
    pub fn cached<T, F>(&self, key: &CacheKey, compute: F) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.lookup::<T>(key)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            CacheMetrics::record_hit(key.function());
            return Ok(value);
        }

        let _gate = self.compute_gate.lock().map_err(poisoned)?;
        if let Some(value) = self.lookup::<T>(key)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            CacheMetrics::record_hit(key.function());
            return Ok(value);
        }

        let started = Instant::now();
        let value = Arc::new(compute()?);
        self.misses.fetch_add(1, Ordering::Relaxed);
        CacheMetrics::record_miss(key.function(), started.elapsed().as_secs_f64());
        debug!("Cache miss for {}", key);

        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(key.clone(), value.clone() as Entry);
        CacheMetrics::record_size(entries.len());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
