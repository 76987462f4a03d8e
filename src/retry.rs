use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use rustc_hash::FxHasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// 最多保留的记录数 / Record capacity before LRU eviction.
    pub max_count: u64,
    /// 连续失败上限；None 或 0 表示关闭。
    pub max_retry_times: Option<u32>,
    /// 记录自最后一次失败起的保留时间 / Retention measured from the last failure.
    pub timeout: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_count: 10_000,
            max_retry_times: None,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryRecord {
    // 保存原始键以识别哈希冲突 / Kept to detect hash collisions.
    pub addr: IpAddr,
    pub name: Arc<str>,
    pub failures: u32,
    pub last_touch: Instant,
}

impl RetryRecord {
    fn matches(&self, addr: IpAddr, name: &str) -> bool {
        self.addr == addr && self.name.eq_ignore_ascii_case(name)
    }
}

/// Use u64 hash as key to avoid allocation during lookup
pub type RetryCache = Cache<u64, RetryRecord>;

/// 创建带 TTL 的 LRU 失败记录表
#[inline]
pub fn new_retry_cache(max_capacity: u64, ttl: Duration) -> RetryCache {
    Cache::builder()
        .max_capacity(max_capacity)
        .time_to_live(ttl.max(Duration::from_millis(1)))
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

#[inline]
fn retry_key(addr: IpAddr, name: &str) -> u64 {
    let mut h = FxHasher::default();
    addr.hash(&mut h);
    for b in name.bytes() {
        h.write_u8(b.to_ascii_lowercase());
    }
    h.finish()
}

/// 按 (地址, 域名) 统计连续失败，超过上限后跳过内核操作。
/// Suppresses kernel work for (address, name) pairs that keep failing.
#[derive(Debug)]
pub struct RetryLimiter {
    settings: RetrySettings,
    // None: 限流关闭 / limiter disabled
    cache: Option<RetryCache>,
}

impl RetryLimiter {
    pub fn new(settings: RetrySettings) -> Self {
        let cache = match settings.max_retry_times {
            Some(max) if max > 0 => Some(new_retry_cache(settings.max_count, settings.timeout)),
            _ => None,
        };
        Self { settings, cache }
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }

    fn max(&self) -> u32 {
        self.settings.max_retry_times.unwrap_or(0)
    }

    pub fn should_skip(&self, addr: IpAddr, name: &str) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match cache.get(&retry_key(addr, name)) {
            Some(record) if record.matches(addr, name) => record.failures >= self.max(),
            _ => false,
        }
    }

    pub fn record_outcome(&self, addr: IpAddr, name: &str, succeeded: bool) {
        let Some(cache) = &self.cache else {
            return;
        };
        let key = retry_key(addr, name);
        if succeeded {
            // 只清除属于自己的记录 / Never clear a colliding pair's record.
            if cache.get(&key).is_some_and(|r| r.matches(addr, name)) {
                cache.invalidate(&key);
            }
            return;
        }

        let max = self.max();
        cache.entry(key).and_upsert_with(|existing| match existing {
            Some(entry) if entry.value().matches(addr, name) => {
                let prev = entry.into_value();
                RetryRecord {
                    failures: prev.failures.saturating_add(1).min(max),
                    last_touch: Instant::now(),
                    ..prev
                }
            }
            // 不存在或哈希冲突：后来者覆盖 / Absent or colliding: the newcomer wins.
            _ => RetryRecord {
                addr,
                name: Arc::from(name),
                failures: 1.min(max),
                last_touch: Instant::now(),
            },
        });
    }

    #[cfg(test)]
    pub fn failures(&self, addr: IpAddr, name: &str) -> u32 {
        self.cache
            .as_ref()
            .and_then(|cache| cache.get(&retry_key(addr, name)))
            .filter(|record| record.matches(addr, name))
            .map(|record| record.failures)
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn len(&self) -> u64 {
        self.cache.as_ref().map(|c| c.entry_count()).unwrap_or(0)
    }
}
