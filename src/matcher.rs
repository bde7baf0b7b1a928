use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;

use crate::config::{self, DefaultSection, ProxyConfig, RuleSection};
use crate::static_answer::{StaticAnswers, compile_static};

/// 默认 bootstrap DNS 端口
const DEFAULT_NAMESERVER_PORT: u16 = 53;

/// 编译后的运行时配置快照，加载后只读，可被并发请求共享
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings: config::ServiceSettings,
    pub default: EffectiveConfig,
    pub rules: Vec<RuntimeRule>,
}

#[derive(Debug, Clone)]
pub struct RuntimeRule {
    pub domain: Regex,
    /// 已与 default 合并后的完整配置
    pub config: EffectiveConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionStrategy {
    Random,
    RoundRobin,
    /// 无法识别的策略名，转发时得到 NoStrategy
    Unknown(String),
}

impl SelectionStrategy {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "random" => SelectionStrategy::Random,
            "round_robin" | "roundrobin" | "round-robin" => SelectionStrategy::RoundRobin,
            _ => SelectionStrategy::Unknown(name.to_string()),
        }
    }
}

/// 单个请求生效的配置。所有字段来源静态可知：规则覆盖或继承 default。
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub upstream_urls: Arc<[String]>,
    pub selection_strategy: SelectionStrategy,
    pub max_retries: u32,
    pub verify_tls: bool,
    pub bootstrap_nameservers: Arc<[SocketAddr]>,
    pub static_answers: Option<Arc<StaticAnswers>>,
}

/// 规则中显式给出的字段（已解析），None 表示继承
#[derive(Debug, Clone, Default)]
pub struct RuleOverrides {
    pub upstream_urls: Option<Arc<[String]>>,
    pub selection_strategy: Option<SelectionStrategy>,
    pub max_retries: Option<u32>,
    pub verify_tls: Option<bool>,
    pub bootstrap_nameservers: Option<Arc<[SocketAddr]>>,
    pub static_answers: Option<Arc<StaticAnswers>>,
}

impl EffectiveConfig {
    fn from_default(section: &DefaultSection) -> anyhow::Result<Self> {
        Ok(Self {
            upstream_urls: compile_urls(&section.upstream_urls)?,
            selection_strategy: SelectionStrategy::parse(&section.selection_strategy),
            max_retries: section.max_retries,
            verify_tls: section.verify_tls,
            bootstrap_nameservers: compile_nameservers(&section.bootstrap_nameservers)?,
            static_answers: section
                .static_answers
                .as_ref()
                .map(compile_static)
                .transpose()?
                .map(Arc::new),
        })
    }

    /// 浅合并：规则中存在的字段覆盖 default，缺省字段继承
    pub fn merged(&self, overrides: &RuleOverrides) -> Self {
        Self {
            upstream_urls: overrides
                .upstream_urls
                .clone()
                .unwrap_or_else(|| self.upstream_urls.clone()),
            selection_strategy: overrides
                .selection_strategy
                .clone()
                .unwrap_or_else(|| self.selection_strategy.clone()),
            max_retries: overrides.max_retries.unwrap_or(self.max_retries),
            verify_tls: overrides.verify_tls.unwrap_or(self.verify_tls),
            bootstrap_nameservers: overrides
                .bootstrap_nameservers
                .clone()
                .unwrap_or_else(|| self.bootstrap_nameservers.clone()),
            static_answers: overrides
                .static_answers
                .clone()
                .or_else(|| self.static_answers.clone()),
        }
    }

    /// 上游 URL 使用主机名时必须有 bootstrap DNS，否则无法连接
    fn check_bootstrap(&self, origin: &str) -> anyhow::Result<()> {
        if !self.bootstrap_nameservers.is_empty() {
            return Ok(());
        }
        for url in self.upstream_urls.iter() {
            let parsed = reqwest::Url::parse(url)?;
            if let Some(host) = parsed.domain() {
                anyhow::bail!(
                    "{origin}: upstream {url} uses host name {host} but bootstrap_nameservers is empty"
                );
            }
        }
        Ok(())
    }
}

impl RuleOverrides {
    fn from_rule(rule: &RuleSection) -> anyhow::Result<Self> {
        Ok(Self {
            upstream_urls: rule.upstream_urls.as_deref().map(compile_urls).transpose()?,
            selection_strategy: rule.selection_strategy.as_deref().map(SelectionStrategy::parse),
            max_retries: rule.max_retries,
            verify_tls: rule.verify_tls,
            bootstrap_nameservers: rule
                .bootstrap_nameservers
                .as_deref()
                .map(compile_nameservers)
                .transpose()?,
            static_answers: rule
                .static_answers
                .as_ref()
                .map(compile_static)
                .transpose()?
                .map(Arc::new),
        })
    }
}

impl RuntimeConfig {
    pub fn from_config(cfg: ProxyConfig) -> anyhow::Result<Self> {
        let default = EffectiveConfig::from_default(&cfg.default).context("compile default")?;
        default.check_bootstrap("default")?;
        warn_unknown_strategy("default", &default.selection_strategy);

        let mut rules = Vec::with_capacity(cfg.rules.len());
        for (idx, r) in cfg.rules.iter().enumerate() {
            let domain = Regex::new(&r.domain)
                .with_context(|| format!("rules[{idx}]: invalid domain pattern {:?}", r.domain))?;
            let overrides = RuleOverrides::from_rule(r)
                .with_context(|| format!("rules[{idx}] ({})", r.domain))?;
            let config = default.merged(&overrides);
            config.check_bootstrap(&format!("rules[{idx}] ({})", r.domain))?;
            warn_unknown_strategy(&r.domain, &config.selection_strategy);
            rules.push(RuntimeRule { domain, config });
        }

        Ok(Self {
            settings: cfg.service,
            default,
            rules,
        })
    }

    /// 按声明顺序搜索首个匹配规则；无匹配时返回 default 本身
    #[inline]
    pub fn resolve(&self, qname: &str) -> &EffectiveConfig {
        self.rules
            .iter()
            .find(|rule| rule.domain.is_match(qname))
            .map(|rule| &rule.config)
            .unwrap_or(&self.default)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.upstream_timeout_ms)
    }
}

fn warn_unknown_strategy(origin: &str, strategy: &SelectionStrategy) {
    if let SelectionStrategy::Unknown(name) = strategy {
        tracing::warn!(target = "config", origin = %origin, strategy = %name, "unknown selection_strategy, matching queries will get NXDOMAIN");
    }
}

fn compile_urls(urls: &[String]) -> anyhow::Result<Arc<[String]>> {
    if urls.is_empty() {
        anyhow::bail!("upstream_urls must not be empty");
    }
    for url in urls {
        let parsed = reqwest::Url::parse(url).with_context(|| format!("invalid upstream url: {url}"))?;
        if !matches!(parsed.scheme(), "https" | "http") {
            anyhow::bail!("upstream url must be http(s): {url}");
        }
    }
    Ok(Arc::from(urls.to_vec()))
}

/// 支持 `1.1.1.1`、`1.1.1.1:5353`、`[2606:4700::1111]:53`、`2606:4700::1111`
pub fn parse_nameserver(s: &str) -> anyhow::Result<SocketAddr> {
    let s = s.trim();
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = s
        .parse()
        .with_context(|| format!("invalid bootstrap nameserver: {s}"))?;
    Ok(SocketAddr::new(ip, DEFAULT_NAMESERVER_PORT))
}

fn compile_nameservers(list: &[String]) -> anyhow::Result<Arc<[SocketAddr]>> {
    let addrs = list
        .iter()
        .map(|s| parse_nameserver(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Arc::from(addrs))
}
