//! TTL cache for tool results.

use moka::sync::Cache;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::CacheConfig;

/// Summary reported by `/health` and the `health_check` tool.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub enabled: bool,
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub struct ResultCache {
    cache: Option<Cache<String, Value>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let cache = config.enabled.then(|| {
            Cache::builder()
                .time_to_live(Duration::from_millis(config.ttl_ms))
                .max_capacity(config.max_entries)
                .build()
        });
        Self {
            cache,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self {
            cache: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Key derived from the tool name and the canonical JSON of its params.
    ///
    /// `serde_json` maps are ordered, so equal objects serialize identically.
    pub fn key_for(tool_name: &str, params: &Value) -> String {
        let bytes = serde_json::to_vec(params).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(tool_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
        format!("{}:{}", tool_name, hex)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        match cache.get(key) {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: Value) {
        if let Some(cache) = &self.cache {
            cache.insert(key, value);
        }
    }

    /// Drop every cached result for one tool.
    pub fn invalidate_tool(&self, tool_name: &str) {
        if let Some(cache) = &self.cache {
            let prefix = format!("{}:", tool_name);
            for (key, _) in cache.iter() {
                if key.starts_with(&prefix) {
                    cache.invalidate(key.as_str());
                }
            }
        }
    }

    pub fn summary(&self) -> CacheSummary {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheSummary {
            enabled: self.cache.is_some(),
            entries: self.cache.as_ref().map(|c| c.entry_count()).unwrap_or(0),
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }
}
