use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;

use crate::config::{self, DatatypeChoice, GlobalSettings, NftConfig};
use crate::nft::{AddrKind, Datatype, Family, SetDescriptor};
use crate::retry::RetrySettings;

/// 编译后的集合目标，加载后不可变 / A compiled set target, immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTarget {
    pub family: Family,
    pub table: Arc<str>,
    pub set: Arc<str>,
    /// None: auto
    pub datatype: Option<Datatype>,
    pub interval: bool,
    pub timeout: Option<Duration>,
}

impl RuleTarget {
    /// 显式类型优先，否则按表族推断 / Explicit datatype first, else inferred from the family.
    pub fn effective_datatype(&self) -> Option<Datatype> {
        self.datatype.or_else(|| self.family.inferred_datatype())
    }

    /// 用于新建集合的描述 / Descriptor used when this target creates its set.
    pub fn descriptor(&self, datatype: Datatype) -> SetDescriptor {
        SetDescriptor {
            name: self.set.to_string(),
            datatype,
            interval: self.interval,
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub settings: GlobalSettings,
    // 按表族分组，组内保持配置顺序
    targets: FxHashMap<Family, Vec<RuleTarget>>,
}

impl RuntimeConfig {
    pub fn from_config(cfg: NftConfig) -> anyhow::Result<Self> {
        config::validate(&cfg)?;

        let mut targets: FxHashMap<Family, Vec<RuleTarget>> = FxHashMap::default();
        for group in cfg.rules {
            let families = group.effective_families();

            for target in &group.sets {
                let table: Arc<str> = Arc::from(target.table.as_str());
                let set: Arc<str> = Arc::from(target.set.as_str());
                let datatype = match target.datatype {
                    DatatypeChoice::Ip => Some(Datatype::Ipv4Addr),
                    DatatypeChoice::Ip6 => Some(Datatype::Ipv6Addr),
                    DatatypeChoice::Auto => None,
                };
                let timeout = target
                    .timeout_ms
                    .filter(|ms| *ms > 0)
                    .map(Duration::from_millis);
                for family in &families {
                    targets.entry(*family).or_default().push(RuleTarget {
                        family: *family,
                        table: table.clone(),
                        set: set.clone(),
                        datatype,
                        interval: target.interval,
                        timeout,
                    });
                }
            }
        }

        Ok(Self {
            settings: cfg.settings,
            targets,
        })
    }

    pub fn targets(&self, family: Family) -> &[RuleTarget] {
        self.targets.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 某类地址要写入的全部目标，按表族路由顺序 / Every target an address kind reaches, in routing order.
    pub fn targets_for(&self, kind: AddrKind) -> impl Iterator<Item = &RuleTarget> + '_ {
        Family::routes_for(kind)
            .iter()
            .flat_map(move |family| self.targets(*family).iter())
    }

    pub fn has_targets_for(&self, kind: AddrKind) -> bool {
        self.targets_for(kind).next().is_some()
    }

    pub fn target_count(&self) -> usize {
        self.targets.values().map(Vec::len).sum()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.connection_timeout_ms)
    }

    pub fn retry_settings(&self) -> RetrySettings {
        let retry = &self.settings.retry;
        RetrySettings {
            max_count: retry.max_count,
            max_retry_times: retry.max_retry_times,
            timeout: Duration::from_millis(retry.timeout_ms),
        }
    }

    pub fn async_mode(&self) -> bool {
        self.settings.async_mode
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            settings: GlobalSettings::default(),
            targets: FxHashMap::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(raw: serde_json::Value) -> RuntimeConfig {
        let cfg: NftConfig = serde_json::from_value(raw).expect("parse config");
        RuntimeConfig::from_config(cfg).expect("compile")
    }

    #[test]
    fn missing_families_default_to_inet() {
        let rt = compile(json!({ "rules": [ { "sets": [ { "table": "t", "set": "s" } ] } ] }));
        assert_eq!(rt.targets(Family::Inet).len(), 1);
        assert_eq!(rt.target_count(), 1);
        assert!(rt.has_targets_for(AddrKind::V4));
        assert!(rt.has_targets_for(AddrKind::V6));
    }

    #[test]
    fn routing_follows_address_kind() {
        let rt = compile(json!({
            "rules": [
                { "families": ["ip6", "ip", "ip", "arp", "netdev"],
                  "sets": [ { "table": "t", "set": "a" }, { "table": "t", "set": "b" } ] },
                { "families": ["bridge"], "sets": [ { "table": "br", "set": "c", "datatype": "ip" } ] }
            ]
        }));
        assert_eq!(rt.targets(Family::Ip).len(), 2);

        let v4: Vec<_> = rt
            .targets_for(AddrKind::V4)
            .map(|t| (t.family, t.set.to_string()))
            .collect();
        assert_eq!(
            v4,
            vec![
                (Family::Ip, "a".to_string()),
                (Family::Ip, "b".to_string()),
                (Family::Bridge, "c".to_string()),
            ]
        );

        let v6: Vec<_> = rt.targets_for(AddrKind::V6).map(|t| t.family).collect();
        assert_eq!(v6, vec![Family::Ip6, Family::Ip6, Family::Bridge]);

        // arp/netdev 被接受但不会被路由到
        assert_eq!(rt.targets(Family::Arp).len(), 2);
        assert!(rt.targets_for(AddrKind::V4).all(|t| t.family != Family::Arp));
    }

    #[test]
    fn datatype_and_timeout_compile() {
        let rt = compile(json!({
            "rules": [ { "families": ["inet", "ip"], "sets": [
                { "table": "t", "set": "s", "datatype": "ip6", "interval": true, "timeout_ms": 1500 },
                { "table": "t", "set": "z", "timeout_ms": 0 }
            ] } ]
        }));
        let inet = rt.targets(Family::Inet);
        assert_eq!(inet[0].effective_datatype(), Some(Datatype::Ipv6Addr));
        assert_eq!(inet[0].timeout, Some(Duration::from_millis(1500)));
        assert!(inet[0].interval);
        assert_eq!(inet[1].timeout, None);
        assert_eq!(inet[1].effective_datatype(), None);
        assert_eq!(rt.targets(Family::Ip)[1].effective_datatype(), Some(Datatype::Ipv4Addr));

        let desc = inet[0].descriptor(Datatype::Ipv6Addr);
        assert_eq!(desc.name, "s");
        assert!(desc.interval);
    }

    #[test]
    fn settings_carry_through() {
        let rt = compile(json!({
            "settings": { "connection_timeout_ms": 10, "async_mode": true,
                          "retry": { "max_count": 5, "max_retry_times": 2, "timeout_ms": 20 } }
        }));
        assert_eq!(rt.connection_timeout(), Duration::from_millis(10));
        assert!(rt.async_mode());
        assert_eq!(
            rt.retry_settings(),
            RetrySettings {
                max_count: 5,
                max_retry_times: Some(2),
                timeout: Duration::from_millis(20),
            }
        );
        assert!(!rt.has_targets_for(AddrKind::V4));
    }
}
