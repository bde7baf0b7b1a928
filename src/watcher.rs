use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::{self, ServiceSettings};
use crate::matcher::RuntimeConfig;

pub fn spawn(path: PathBuf, pipeline: Arc<ArcSwap<RuntimeConfig>>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, pipeline) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

/// 加载并编译配置；失败时调用方保留旧快照
pub fn reload(path: &Path) -> anyhow::Result<RuntimeConfig> {
    let cfg = config::load_config(path)?;
    RuntimeConfig::from_config(cfg)
}

/// 只在启动时读取的 service 字段（socket、缓存容量、HTTP 客户端超时、降权身份）
fn restart_only_changes(old: &ServiceSettings, new: &ServiceSettings) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if old.bind_udp != new.bind_udp {
        changed.push("bind_udp");
    }
    if old.udp_buffer_size != new.udp_buffer_size {
        changed.push("udp_buffer_size");
    }
    if old.upstream_timeout_ms != new.upstream_timeout_ms {
        changed.push("upstream_timeout_ms");
    }
    if old.cache_size != new.cache_size {
        changed.push("cache_size");
    }
    if old.runas_user != new.runas_user || old.runas_group != new.runas_group {
        changed.push("runas");
    }
    changed
}

/// 按域名模式比较规则列表：(新增, 移除)
fn rule_changes(old: &RuntimeConfig, new: &RuntimeConfig) -> (Vec<String>, Vec<String>) {
    let old_domains: Vec<&str> = old.rules.iter().map(|r| r.domain.as_str()).collect();
    let new_domains: Vec<&str> = new.rules.iter().map(|r| r.domain.as_str()).collect();
    let added = new_domains
        .iter()
        .filter(|d| !old_domains.contains(d))
        .map(|d| d.to_string())
        .collect();
    let removed = old_domains
        .iter()
        .filter(|d| !new_domains.contains(d))
        .map(|d| d.to_string())
        .collect();
    (added, removed)
}

fn log_changes(old: &RuntimeConfig, new: &RuntimeConfig) {
    let ignored = restart_only_changes(&old.settings, &new.settings);
    if !ignored.is_empty() {
        warn!(target = "watcher", fields = ?ignored, "service settings changed, restart required to apply");
    }
    let (added, removed) = rule_changes(old, new);
    info!(
        target = "watcher",
        rules = new.rules.len(),
        added = ?added,
        removed = ?removed,
        upstreams = new.default.upstream_urls.len(),
        "rules updated"
    );
}

fn run_watcher(path: PathBuf, pipeline: Arc<ArcSwap<RuntimeConfig>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                // Simple retry mechanism to handle file write races (e.g. truncate+write)
                let mut retries = 3;
                while retries > 0 {
                    match reload(&path) {
                        Ok(new_cfg) => {
                            log_changes(&pipeline.load(), &new_cfg);
                            pipeline.store(Arc::new(new_cfg));
                            info!(target = "watcher", path = %path.display(), "config reloaded");
                            break;
                        }
                        Err(err) => {
                            retries -= 1;
                            if retries == 0 {
                                warn!(target = "watcher", path = %path.display(), error = %format!("{err:#}"), "config reload failed, keeping old config");
                            } else {
                                thread::sleep(Duration::from_millis(50));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}
