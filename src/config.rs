use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use hickory_proto::rr::Name;
use serde::Deserialize;
use tracing::{info, warn};

use crate::answer::Answer;
use crate::cache::{Cache, DEFAULT_CLEANING_INTERVAL, DEFAULT_MAX_ENTRIES, LruCache, ResolverCache};
use crate::resolver::RetryPolicy;
use crate::selector::SelectorKind;

pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
pub const DEFAULT_PORT: u16 = 53;

/// Where and how to send queries, as read from resolv.conf.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub nameservers: Vec<SocketAddr>,
    /// Local domain; expands relative names when `search` is empty.
    pub domain: Option<Name>,
    pub search: Vec<Name>,
    /// `options timeout:N`, overrides the resolver's per-attempt timeout.
    pub timeout: Option<Duration>,
    /// `options rotate`.
    pub rotate: bool,
}

impl ResolverConfig {
    pub fn from_nameservers(nameservers: Vec<SocketAddr>) -> Self {
        Self {
            nameservers,
            ..Self::default()
        }
    }

    /// Suffixes tried for relative names: the search list, else the domain.
    pub fn search_suffixes(&self) -> &[Name] {
        if !self.search.is_empty() {
            return &self.search;
        }
        self.domain.as_slice()
    }
}

/// Parses resolv.conf text. Lines starting with `#` or `;`, blank lines,
/// unknown directives and unparsable values are skipped.
pub fn parse_resolv_conf(text: &str, port: u16) -> ResolverConfig {
    let mut cfg = ResolverConfig::default();
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut tokens = line.split_whitespace();
        let Some(directive) = tokens.next() else {
            continue;
        };
        let args: Vec<&str> = tokens.collect();
        if args.is_empty() {
            continue;
        }

        match directive {
            "nameserver" => match parse_nameserver(args[0], port) {
                Some(addr) => cfg.nameservers.push(addr),
                None => warn!(target = "config", value = args[0], "skipping malformed nameserver"),
            },
            "domain" => match absolute_name(args[0]) {
                Some(name) => cfg.domain = Some(name),
                None => warn!(target = "config", value = args[0], "skipping malformed domain"),
            },
            "search" => {
                // 多行 search 依次追加
                cfg.search.extend(args.iter().filter_map(|s| absolute_name(s)));
            }
            "options" => {
                for opt in &args {
                    if *opt == "rotate" {
                        cfg.rotate = true;
                    } else if let Some(secs) = opt.strip_prefix("timeout:") {
                        if let Ok(secs) = secs.parse::<u64>() {
                            cfg.timeout = Some(Duration::from_secs(secs));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    cfg
}

pub fn read_resolv_conf(path: &Path, port: u16) -> Result<ResolverConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read resolv.conf: {}", path.display()))?;
    let cfg = parse_resolv_conf(&raw, port);
    info!(
        target = "config",
        path = %path.display(),
        nameservers = cfg.nameservers.len(),
        search = cfg.search.len(),
        "resolv.conf loaded"
    );
    Ok(cfg)
}

/// `ip` (with `port`) or `ip:port` / `[v6]:port`.
pub fn parse_nameserver(value: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    value.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port))
}

fn absolute_name(value: &str) -> Option<Name> {
    let mut name = Name::from_str(value).ok()?;
    name.set_fqdn(true);
    Some(name)
}

/// JSON settings file. Every field has a default, so `{}` is valid.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolverSettings {
    /// resolv.conf 路径，未指定 nameservers 时从中读取。
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,
    /// 覆盖 resolv.conf 的上游列表（`ip` 或 `ip:port`）。
    #[serde(default)]
    pub nameservers: Vec<String>,
    /// 未写端口时使用的端口，缺省53。
    #[serde(default = "default_port")]
    pub port: u16,
    /// 单次尝试超时（毫秒）。
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 整个解析的时间预算（毫秒）。
    #[serde(default = "default_lifetime_ms")]
    pub lifetime_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_true")]
    pub tcp_fallback: bool,
    #[serde(default)]
    pub use_tcp: bool,
    #[serde(default)]
    pub retry_servfail: bool,
    #[serde(default)]
    pub rotate: bool,
    #[serde(default)]
    pub selector: SelectorKind,
    #[serde(default)]
    pub cache: CacheSettings,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            resolv_conf: default_resolv_conf(),
            nameservers: Vec::new(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            lifetime_ms: default_lifetime_ms(),
            retry_policy: RetryPolicy::default(),
            tcp_fallback: true,
            use_tcp: false,
            retry_servfail: false,
            rotate: false,
            selector: SelectorKind::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl ResolverSettings {
    pub fn parse_nameservers(&self) -> Result<Vec<SocketAddr>> {
        self.nameservers
            .iter()
            .map(|s| {
                parse_nameserver(s.trim(), self.port)
                    .with_context(|| format!("invalid nameserver address: {s}"))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    #[default]
    None,
    Ttl,
    Lru,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub kind: CacheKind,
    /// TTL 缓存后台清理间隔（毫秒），0 表示不启动清理线程。
    #[serde(default = "default_cleaning_interval_ms")]
    pub cleaning_interval_ms: u64,
    /// LRU 缓存容量。
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            kind: CacheKind::default(),
            cleaning_interval_ms: default_cleaning_interval_ms(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheSettings {
    pub fn build(&self) -> Option<Arc<dyn ResolverCache>> {
        match self.kind {
            CacheKind::None => None,
            CacheKind::Ttl => Some(Arc::new(Cache::<Answer>::with_cleaning_interval(
                Duration::from_millis(self.cleaning_interval_ms),
            ))),
            CacheKind::Lru => Some(Arc::new(LruCache::<Answer>::new(self.max_entries))),
        }
    }
}

pub fn load_settings(path: &Path) -> Result<ResolverSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read settings file: {}", path.display()))?;
    let settings: ResolverSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse settings file: {}", path.display()))?;

    // 提前校验上游地址，避免运行时才失败 / validate nameservers up front
    settings.parse_nameservers()?;
    info!(target = "config", path = %path.display(), "settings loaded");
    Ok(settings)
}


fn default_resolv_conf() -> PathBuf {
    PathBuf::from(DEFAULT_RESOLV_CONF)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_lifetime_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_cleaning_interval_ms() -> u64 {
    DEFAULT_CLEANING_INTERVAL.as_millis() as u64
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}
