use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hickory_proto::rr::RecordType;
use moka::Expiry;
use moka::sync::Cache;
use rustc_hash::FxHasher;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bytes: Bytes,
    pub source: Arc<str>,
    // Store validation fields to handle hash collisions
    pub qname: Arc<str>,
    pub qtype: u16,
    pub ttl: Duration,
    /// 写入时间，命中时据此递减应答中的 TTL
    pub inserted_at: Instant,
}

impl CacheEntry {
    #[inline]
    pub fn matches(&self, qname: &str, qtype: RecordType) -> bool {
        self.qtype == u16::from(qtype) && self.qname.eq_ignore_ascii_case(qname)
    }

    /// 已在缓存中停留的整秒数
    #[inline]
    pub fn age_secs(&self) -> u32 {
        u32::try_from(self.inserted_at.elapsed().as_secs()).unwrap_or(u32::MAX)
    }
}

/// Use u64 hash as key to avoid allocation during lookup
pub type DnsCache = Cache<u64, CacheEntry>;

/// 每条缓存按应答的最小 TTL 过期
struct AnswerTtl;

impl Expiry<u64, CacheEntry> for AnswerTtl {
    fn expire_after_create(&self, _key: &u64, value: &CacheEntry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// 创建按记录 TTL 过期的 DNS 缓存
#[inline]
pub fn new_cache(max_capacity: u64) -> DnsCache {
    Cache::builder()
        .max_capacity(max_capacity)
        .expire_after(AnswerTtl)
        .build()
}

#[inline]
pub fn cache_key(qname: &str, qtype: RecordType) -> u64 {
    let mut h = FxHasher::default();
    qname.to_ascii_lowercase().hash(&mut h);
    u16::from(qtype).hash(&mut h);
    h.finish()
}
