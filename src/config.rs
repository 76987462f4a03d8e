use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::nft::Family;

/// nftables 表名/集合名的内核上限（含结尾 NUL）。
const NFT_NAME_MAXLEN: usize = 256;

#[derive(Debug, Clone, Deserialize)]
pub struct NftConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: GlobalSettings,
    /// 规则组：每组把若干集合目标应用到若干表族。
    #[serde(default)]
    pub rules: Vec<RuleGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSettings {
    /// 应答输入的 UDP 监听地址，缺省仅本机。
    #[serde(default = "default_bind_udp")]
    pub bind_udp: String,
    /// 空闲内核会话的存活时间（毫秒），即连接池 TTL。
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// 每个新会话在新的网络命名空间内打开。
    #[serde(default)]
    pub isolate_namespace: bool,
    /// 异步模式：不等待内核写入完成。
    #[serde(default)]
    pub async_mode: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Prometheus 抓取端点地址，缺省不开启；仅启动时读取。
    #[serde(default)]
    pub metrics_listen: Option<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            bind_udp: default_bind_udp(),
            connection_timeout_ms: default_connection_timeout_ms(),
            isolate_namespace: false,
            async_mode: false,
            retry: RetryConfig::default(),
            metrics_listen: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// 失败记录容量，超出按 LRU 淘汰。
    #[serde(default = "default_retry_max_count")]
    pub max_count: u64,
    /// 连续失败上限，缺省或 0 表示不限流。
    #[serde(default)]
    pub max_retry_times: Option<u32>,
    /// 失败记录保留时间（毫秒）。
    #[serde(default = "default_retry_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_count: default_retry_max_count(),
            max_retry_times: None,
            timeout_ms: default_retry_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleGroup {
    /// 缺省为 inet。
    #[serde(default)]
    pub families: Vec<Family>,
    #[serde(default)]
    pub sets: Vec<SetTarget>,
}

impl RuleGroup {
    /// 空列表按 inet 处理；重复的表族只保留首次出现。
    pub fn effective_families(&self) -> Vec<Family> {
        if self.families.is_empty() {
            return vec![Family::Inet];
        }
        let mut families = Vec::with_capacity(self.families.len());
        for family in &self.families {
            if !families.contains(family) {
                families.push(*family);
            }
        }
        families
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetTarget {
    pub table: String,
    pub set: String,
    #[serde(default)]
    pub datatype: DatatypeChoice,
    /// 区间集合。
    #[serde(default)]
    pub interval: bool,
    /// 元素超时（毫秒），0 表示永不过期。
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatatypeChoice {
    Ip,
    Ip6,
    /// 由表族推断（仅 ip/ip6 可推断）。
    #[default]
    Auto,
}

pub fn load_config(path: &Path) -> Result<NftConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: NftConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    validate(&cfg).with_context(|| format!("validate config file: {}", path.display()))?;
    Ok(cfg)
}

/// 轻量校验：名字长度，以及无法推断类型的组合提前告警。
pub fn validate(cfg: &NftConfig) -> Result<()> {
    for (idx, group) in cfg.rules.iter().enumerate() {
        for target in &group.sets {
            check_name("table", &target.table)
                .with_context(|| format!("rules[{}]", idx))?;
            check_name("set", &target.set).with_context(|| format!("rules[{}]", idx))?;
        }
    }
    for (family, target) in uninferable_targets(cfg) {
        warn!(
            target = "config",
            family = %family,
            table = %target.table,
            set = %target.set,
            "datatype auto cannot be inferred for this family, new sets will be skipped"
        );
    }
    Ok(())
}

/// `auto` 目标与无法推断类型的表族的组合。
pub fn uninferable_targets(cfg: &NftConfig) -> Vec<(Family, &SetTarget)> {
    let mut out = Vec::new();
    for group in &cfg.rules {
        let families = group.effective_families();
        for target in group.sets.iter().filter(|t| t.datatype == DatatypeChoice::Auto) {
            for family in &families {
                if family.inferred_datatype().is_none() {
                    out.push((*family, target));
                }
            }
        }
    }
    out
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} name empty", kind);
    }
    if name.len() >= NFT_NAME_MAXLEN {
        anyhow::bail!("{} name too long: {} bytes", kind, name.len());
    }
    Ok(())
}

fn default_bind_udp() -> String {
    "127.0.0.1:5354".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    300_000
}

fn default_retry_max_count() -> u64 {
    10_000
}

fn default_retry_timeout_ms() -> u64 {
    300_000
}
