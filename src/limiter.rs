use std::net::IpAddr;
use std::time::Duration;

use moka::sync::Cache;

use crate::config::LimiterConfig;

/// Entry budget of the counting cache; under pressure entries may be evicted
/// before their TTL.
const CACHE_MAX_ENTRIES: u64 = 1_000_000;

/// TTL-bounded counting cache deciding whether a (client, rule source) pair
/// has used up its switch budget. Safe for concurrent callers; the count is
/// approximate under bursts.
pub struct Limiter {
    cache: Cache<String, u32>,
}

impl Limiter {
    pub fn new(config: &LimiterConfig) -> Self {
        Self::with_ttl(config.ttl)
    }

    fn with_ttl(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(CACHE_MAX_ENTRIES)
            .time_to_live(ttl)
            .build();

        Self { cache }
    }

    /// Returns `true` when the caller must suppress the switch for this
    /// (address, source) pair. Otherwise the grant is recorded under a
    /// refreshed TTL. `max_count == 0` disables limiting and never touches
    /// the cache.
    pub fn limit(&self, addr: IpAddr, source: &str, max_count: u32) -> bool {
        if max_count == 0 {
            return false;
        }

        let key = make_key(addr, source);
        let count = self.cache.get(&key).unwrap_or(0);
        if count < max_count {
            self.cache.insert(key, count + 1);

            return false;
        }

        true
    }
}

fn make_key(addr: IpAddr, source: &str) -> String {
    format!("{addr}:{source}")
}
