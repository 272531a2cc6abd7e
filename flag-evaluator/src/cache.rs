use std::time::{Duration, Instant};

use dashmap::DashMap;

struct CacheEntry {
    value: bool,
    inserted_at: Instant,
}

/// TTL-bound `(tenant, flag) -> bool` cache.
///
/// Purely a local read optimization: correctness holds identically with the
/// cache disabled, since every entry is an idempotent projection of store
/// state at read time. Concurrent `get`/`set` on the same key may race; the
/// only visible effect is which of two equally valid reads wins the slot.
///
/// Environment scoping is structural: one cache belongs to one evaluator,
/// and one evaluator is bound to one environment, so keys never need an
/// environment component.
pub struct FlagCache {
    ttl: Duration,
    entries: DashMap<(String, String), CacheEntry>,
}

impl FlagCache {
    /// TTL is fixed for the lifetime of the cache.
    pub fn new(ttl: Duration) -> Self {
        FlagCache {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A miss means the key was never set or its TTL elapsed; callers cannot
    /// distinguish the two, and both require a fresh store read.
    pub fn get(&self, tenant_id: &str, flag_key: &str) -> Option<bool> {
        let key = (tenant_id.to_string(), flag_key.to_string());
        let entry = self.entries.get(&key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            // Expired entries are left in place; the next set overwrites them.
            return None;
        }
        Some(entry.value)
    }

    pub fn set(&self, tenant_id: &str, flag_key: &str, value: bool) {
        let key = (tenant_id.to_string(), flag_key.to_string());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, tenant_id: &str, flag_key: &str) {
        let key = (tenant_id.to_string(), flag_key.to_string());
        self.entries.remove(&key);
    }

    /// Used after bulk or administrative changes.
    pub fn invalidate_all(&self) {
        self.entries.clear();
    }
}
