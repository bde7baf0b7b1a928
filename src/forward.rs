use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bootstrap::BootstrapResolver;
use crate::matcher::EffectiveConfig;
use crate::selector::{SelectError, UpstreamSelector};

/// RFC 8484 §4.1
pub const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardResult {
    Answer(Bytes),
    /// 所有尝试均失败
    Exhausted,
    /// 选择策略无法识别
    NoStrategy,
}

/// 配置类错误，不参与重试
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("cannot select upstream: {0}")]
    Selection(#[from] SelectError),
}

#[derive(Debug, Clone)]
pub struct DohReply {
    pub status: u16,
    pub body: Bytes,
}

/// 出站连接参数：TLS 校验开关与 bootstrap nameserver 列表
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportOptions {
    pub verify_tls: bool,
    pub bootstrap_nameservers: Arc<[SocketAddr]>,
}

impl From<&EffectiveConfig> for TransportOptions {
    fn from(cfg: &EffectiveConfig) -> Self {
        Self {
            verify_tls: cfg.verify_tls,
            bootstrap_nameservers: cfg.bootstrap_nameservers.clone(),
        }
    }
}

/// 单次 DoH POST。状态码判断留给调用方。
pub trait DohTransport: Send + Sync + 'static {
    fn post(
        &self,
        url: &str,
        body: Bytes,
        opts: &TransportOptions,
    ) -> impl Future<Output = anyhow::Result<DohReply>> + Send;
}

/// 基于 reqwest 的 DoH 传输；每组 [`TransportOptions`] 复用一个连接池客户端
pub struct HttpsTransport {
    clients: DashMap<TransportOptions, reqwest::Client>,
    timeout: Duration,
}

impl HttpsTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            timeout,
        }
    }

    fn client_for(&self, opts: &TransportOptions) -> anyhow::Result<reqwest::Client> {
        if let Some(client) = self.clients.get(opts) {
            return Ok(client.clone());
        }
        let resolver = BootstrapResolver::new(opts.bootstrap_nameservers.clone(), self.timeout);
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(!opts.verify_tls)
            .dns_resolver(Arc::new(resolver))
            .no_proxy()
            .timeout(self.timeout)
            .pool_max_idle_per_host(4)
            .build()
            .context("build DoH http client")?;
        // 并发构建时保留先写入者
        Ok(self
            .clients
            .entry(opts.clone())
            .or_insert(client)
            .value()
            .clone())
    }
}

impl DohTransport for HttpsTransport {
    async fn post(
        &self,
        url: &str,
        body: Bytes,
        opts: &TransportOptions,
    ) -> anyhow::Result<DohReply> {
        let client = self.client_for(opts)?;
        let response = client
            .post(url)
            .header(CONTENT_TYPE, DNS_MESSAGE_CONTENT_TYPE)
            .header(ACCEPT, DNS_MESSAGE_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .with_context(|| format!("DoH request to {url} failed"))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("read DoH response from {url}"))?;
        Ok(DohReply { status, body })
    }
}

/// 有界重试的 DoH 转发
pub struct ForwardClient<T> {
    transport: T,
    selector: UpstreamSelector,
}

impl<T: DohTransport> ForwardClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            selector: UpstreamSelector::new(),
        }
    }

    /// Performs exactly `cfg.max_retries` attempts (none when it is 0).
    ///
    /// Non-200 statuses and transport errors count as failed attempts and are
    /// only logged; the first 200 wins. An unknown strategy is detected before
    /// any network call of the attempt that discovers it.
    pub async fn forward(
        &self,
        raw: &Bytes,
        cfg: &EffectiveConfig,
    ) -> Result<ForwardResult, ForwardError> {
        let opts = TransportOptions::from(cfg);
        for attempt in 1..=cfg.max_retries {
            let url = match self.selector.select(&cfg.selection_strategy, &cfg.upstream_urls) {
                Ok(url) => url,
                Err(SelectError::UnknownStrategy(name)) => {
                    warn!(event = "no_strategy", strategy = %name, "no DoH url select method");
                    return Ok(ForwardResult::NoStrategy);
                }
                Err(err) => return Err(err.into()),
            };

            debug!(upstream = %url, attempt, max = cfg.max_retries, "using upstream");
            let start = Instant::now();
            match self.transport.post(url, raw.clone(), &opts).await {
                Ok(reply) if reply.status == 200 => {
                    debug!(
                        upstream = %url,
                        attempt,
                        latency_ms = start.elapsed().as_millis() as u64,
                        "upstream answered"
                    );
                    return Ok(ForwardResult::Answer(reply.body));
                }
                Ok(reply) => {
                    warn!(upstream = %url, attempt, status = reply.status, "upstream returned non-200 status");
                }
                Err(err) => {
                    warn!(upstream = %url, attempt, error = %format!("{err:#}"), "error requesting DoH");
                }
            }
        }
        Ok(ForwardResult::Exhausted)
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }
}
