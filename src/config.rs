use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub service: ServiceSettings,
    /// 默认配置，必须提供 EffectiveConfig 的全部字段。
    pub default: DefaultSection,
    /// 按域名匹配的覆盖规则（按声明顺序评估，首个命中生效）。
    #[serde(default)]
    pub rules: Vec<RuleSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    /// UDP监听地址，缺省0.0.0.0:53；以 root 启动时绑定后降权。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// 单次 DoH 请求超时（毫秒），同时约束 bootstrap 解析。
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// UDP 接收缓冲区大小，超出部分会被截断。
    #[serde(default = "default_udp_buffer_size")]
    pub udp_buffer_size: usize,
    /// 响应缓存条目上限，0 表示禁用缓存。
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
    /// 缓存 TTL 上限（秒）。
    #[serde(default = "default_cache_max_ttl_secs")]
    pub cache_max_ttl_secs: u64,
    /// 以 root 启动时，绑定端口后切换到的用户（缺省 nobody）。
    #[serde(default)]
    pub runas_user: Option<String>,
    /// 切换到的用户组（缺省为该用户的主组）。
    #[serde(default)]
    pub runas_group: Option<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            udp_buffer_size: default_udp_buffer_size(),
            cache_size: default_cache_size(),
            cache_max_ttl_secs: default_cache_max_ttl_secs(),
            runas_user: None,
            runas_group: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefaultSection {
    /// DoH 上游 URL 列表，不能为空。
    pub upstream_urls: Vec<String>,
    /// 上游选择策略：random / round_robin。
    #[serde(default = "default_selection_strategy")]
    pub selection_strategy: String,
    /// 最大尝试次数，0 表示不转发。
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 是否校验上游 TLS 证书。
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    /// 仅用于解析上游主机名的 DNS 服务器（IP 或 IP:端口）。
    #[serde(default)]
    pub bootstrap_nameservers: Vec<String>,
    /// 记录类型 -> 应答数据；存在时该域名只在本地应答。
    #[serde(default, rename = "static")]
    pub static_answers: Option<BTreeMap<String, String>>,
}

/// 单条规则：`domain` 为正则（搜索语义），其余字段缺省时继承 default。
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSection {
    pub domain: String,
    #[serde(default)]
    pub upstream_urls: Option<Vec<String>>,
    #[serde(default)]
    pub selection_strategy: Option<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub verify_tls: Option<bool>,
    #[serde(default)]
    pub bootstrap_nameservers: Option<Vec<String>>,
    #[serde(default, rename = "static")]
    pub static_answers: Option<BTreeMap<String, String>>,
}

pub fn load_config(path: &Path) -> Result<ProxyConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: ProxyConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    validate(&cfg)?;
    Ok(cfg)
}

/// 轻量校验：结构性错误在加载时直接失败，正则/静态数据在编译阶段再检查。
pub fn validate(cfg: &ProxyConfig) -> Result<()> {
    if cfg.default.upstream_urls.is_empty() {
        anyhow::bail!("default.upstream_urls must not be empty");
    }
    for (idx, rule) in cfg.rules.iter().enumerate() {
        if rule.domain.is_empty() {
            anyhow::bail!("rules[{idx}].domain must not be empty");
        }
        if let Some(urls) = &rule.upstream_urls {
            if urls.is_empty() {
                anyhow::bail!("rules[{idx}] ({}) has an empty upstream_urls list", rule.domain);
            }
        }
    }
    for (key, value) in [
        ("runas_user", &cfg.service.runas_user),
        ("runas_group", &cfg.service.runas_group),
    ] {
        if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
            anyhow::bail!("service.{key} must not be empty when set");
        }
    }
    if cfg.service.udp_buffer_size < 512 {
        anyhow::bail!(
            "service.udp_buffer_size must be at least 512, got {}",
            cfg.service.udp_buffer_size
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_section_fills_optional_fields() {
        let raw = json!({
            "default": { "upstream_urls": ["https://1.1.1.1/dns-query"] }
        });
        let cfg: ProxyConfig = serde_json::from_value(raw).expect("parse config");
        assert_eq!(cfg.default.selection_strategy, "random");
        assert_eq!(cfg.default.max_retries, 3);
        assert!(cfg.default.verify_tls);
        assert!(cfg.default.static_answers.is_none());
        assert!(cfg.rules.is_empty());
        assert_eq!(cfg.service.bind_udp, "0.0.0.0:53");
        assert!(cfg.service.runas_user.is_none());
        assert!(cfg.service.runas_group.is_none());
        assert_eq!(cfg.service.upstream_timeout_ms, 5000);
        validate(&cfg).expect("valid");
    }

    #[test]
    fn rule_fields_default_to_none() {
        let raw = json!({
            "default": { "upstream_urls": ["https://1.1.1.1/dns-query"] },
            "rules": [ { "domain": "example" } ]
        });
        let cfg: ProxyConfig = serde_json::from_value(raw).expect("parse config");
        let rule = &cfg.rules[0];
        assert!(rule.upstream_urls.is_none());
        assert!(rule.selection_strategy.is_none());
        assert!(rule.max_retries.is_none());
        assert!(rule.verify_tls.is_none());
        assert!(rule.static_answers.is_none());
    }

    #[test]
    fn static_section_uses_reserved_word_key() {
        let raw = json!({
            "default": { "upstream_urls": ["https://1.1.1.1/dns-query"] },
            "rules": [ { "domain": "lan", "static": { "A": "10.0.0.1" } } ]
        });
        let cfg: ProxyConfig = serde_json::from_value(raw).expect("parse config");
        let answers = cfg.rules[0].static_answers.as_ref().expect("static");
        assert_eq!(answers.get("A").map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn missing_default_upstreams_is_rejected() {
        let raw = json!({ "default": { "upstream_urls": [] } });
        let cfg: ProxyConfig = serde_json::from_value(raw).expect("parse config");
        assert!(validate(&cfg).is_err());

        let raw = json!({ "default": {} });
        assert!(serde_json::from_value::<ProxyConfig>(raw).is_err());
    }

    #[test]
    fn empty_rule_pool_is_rejected() {
        let raw = json!({
            "default": { "upstream_urls": ["https://1.1.1.1/dns-query"] },
            "rules": [ { "domain": "corp", "upstream_urls": [] } ]
        });
        let cfg: ProxyConfig = serde_json::from_value(raw).expect("parse config");
        let err = validate(&cfg).expect_err("empty pool");
        assert!(err.to_string().contains("rules[0]"));
    }

    #[test]
    fn service_accepts_runas_identity() {
        let raw = json!({
            "service": { "bind_udp": "0.0.0.0:53", "runas_user": "dohproxy", "runas_group": "nogroup" },
            "default": { "upstream_urls": ["https://1.1.1.1/dns-query"] }
        });
        let cfg: ProxyConfig = serde_json::from_value(raw).expect("parse config");
        assert_eq!(cfg.service.runas_user.as_deref(), Some("dohproxy"));
        assert_eq!(cfg.service.runas_group.as_deref(), Some("nogroup"));
        validate(&cfg).expect("valid");

        let raw = json!({
            "service": { "runas_user": " " },
            "default": { "upstream_urls": ["https://1.1.1.1/dns-query"] }
        });
        let cfg: ProxyConfig = serde_json::from_value(raw).expect("parse config");
        let err = validate(&cfg).expect_err("blank user");
        assert!(err.to_string().contains("runas_user"));
    }
}

fn default_bind_udp() -> String {
    "0.0.0.0:53".to_string()
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

fn default_udp_buffer_size() -> usize {
    4096
}

fn default_cache_size() -> u64 {
    4096
}

fn default_cache_max_ttl_secs() -> u64 {
    300
}

fn default_selection_strategy() -> String {
    "random".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_verify_tls() -> bool {
    true
}
