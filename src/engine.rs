use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use hickory_proto::op::ResponseCode;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, DnsCache, cache_key, new_cache};
use crate::forward::{DohTransport, ForwardClient, ForwardResult, HttpsTransport};
use crate::matcher::RuntimeConfig;
use crate::proto_utils::{
    ParsedQuery, build_nxdomain, parse_query, parse_response_quick, refresh_cached_response,
};
use crate::static_answer;

/// 查询路由：解析 -> 规则匹配 -> 静态应答 -> 缓存 -> DoH 转发
pub struct Engine<T = HttpsTransport> {
    pipeline: Arc<ArcSwap<RuntimeConfig>>,
    forwarder: Arc<ForwardClient<T>>,
    cache: Option<DnsCache>,
}

impl<T> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            forwarder: Arc::clone(&self.forwarder),
            cache: self.cache.clone(),
        }
    }
}

impl Engine<HttpsTransport> {
    pub fn new(pipeline: Arc<ArcSwap<RuntimeConfig>>) -> Self {
        let timeout = pipeline.load().upstream_timeout();
        Self::with_transport(pipeline, HttpsTransport::new(timeout))
    }
}

impl<T: DohTransport> Engine<T> {
    pub fn with_transport(pipeline: Arc<ArcSwap<RuntimeConfig>>, transport: T) -> Self {
        // 缓存容量取自初始配置，热更新不重建缓存
        let cache_size = pipeline.load().settings.cache_size;
        let cache = (cache_size > 0).then(|| new_cache(cache_size));
        Self {
            pipeline,
            forwarder: Arc::new(ForwardClient::new(transport)),
            cache,
        }
    }

    /// 处理一个入站请求包。
    ///
    /// `Ok(Some)` 为需要回给客户端的完整 DNS 报文；`Ok(None)` 表示重试耗尽，
    /// 不发送任何应答（由客户端自行超时重试）。格式错误的请求返回 `Err`，
    /// 调用方只需丢弃，不能把它当作 NXDOMAIN。
    pub async fn handle(&self, packet: &[u8]) -> anyhow::Result<Option<Bytes>> {
        let query = parse_query(packet)?;
        let start = Instant::now();
        let cfg = self.pipeline.load_full();
        let eff = cfg.resolve(&query.qname);

        if let Some(resp) = static_answer::try_answer(eff, &query)? {
            info!(
                event = "dns_response",
                qname = %query.qname,
                qtype = %query.qtype,
                source = "static",
                latency_ms = start.elapsed().as_millis() as u64,
                "static answer"
            );
            return Ok(Some(resp));
        }

        if let Some(resp) = self.cache_lookup(&query) {
            return Ok(Some(resp));
        }

        match self.forwarder.forward(&query.raw, eff).await? {
            ForwardResult::Answer(bytes) => {
                info!(
                    event = "dns_response",
                    qname = %query.qname,
                    qtype = %query.qtype,
                    source = "upstream",
                    latency_ms = start.elapsed().as_millis() as u64,
                    "forwarded"
                );
                self.cache_store(&query, &bytes, cfg.settings.cache_max_ttl_secs);
                Ok(Some(bytes))
            }
            ForwardResult::Exhausted => {
                warn!(
                    event = "dns_drop",
                    qname = %query.qname,
                    qtype = %query.qtype,
                    attempts = eff.max_retries,
                    "all DoH attempts failed, no reply sent"
                );
                Ok(None)
            }
            ForwardResult::NoStrategy => Ok(Some(build_nxdomain(&query)?)),
        }
    }

    fn cache_lookup(&self, query: &ParsedQuery) -> Option<Bytes> {
        let cache = self.cache.as_ref()?;
        let hit = cache.get(&cache_key(&query.qname, query.qtype))?;
        if !hit.matches(&query.qname, query.qtype) {
            return None;
        }
        let age = hit.age_secs();
        let Some(resp) = refresh_cached_response(&hit.bytes, &query.raw, age) else {
            debug!(qname = %query.qname, qtype = %query.qtype, "cached response unusable, forwarding");
            return None;
        };
        debug!(
            event = "dns_response",
            qname = %query.qname,
            qtype = %query.qtype,
            upstream = %hit.source,
            cache = true,
            age_secs = age,
            "cache hit"
        );
        Some(resp)
    }

    /// 仅缓存 NOERROR/NXDOMAIN 且 TTL 大于 0 的完整应答；
    /// 否定应答的 TTL 来自 authority 段的 SOA，没有 SOA 的不缓存
    fn cache_store(&self, query: &ParsedQuery, bytes: &Bytes, max_ttl_secs: u64) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let Some(quick) = parse_response_quick(bytes) else {
            return;
        };
        if quick.truncated || !matches!(quick.rcode, ResponseCode::NoError | ResponseCode::NXDomain) {
            return;
        }
        let ttl = u64::from(quick.min_ttl).min(max_ttl_secs);
        if ttl == 0 {
            return;
        }
        let entry = CacheEntry {
            bytes: bytes.clone(),
            source: Arc::from("upstream"),
            qname: Arc::from(query.qname.as_str()),
            qtype: u16::from(query.qtype),
            ttl: Duration::from_secs(ttl),
            inserted_at: Instant::now(),
        };
        cache.insert(cache_key(&query.qname, query.qtype), entry);
    }
}
