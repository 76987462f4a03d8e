use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::config::GlobalSettings;
use crate::error::Result;

/// nftables 表族 / nftables table family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ip,
    Ip6,
    Inet,
    Arp,
    Bridge,
    Netdev,
}

impl Family {
    /// NFPROTO_* value carried in nfgenmsg.
    pub fn nfproto(self) -> u8 {
        match self {
            Family::Inet => 1,
            Family::Ip => 2,
            Family::Arp => 3,
            Family::Netdev => 5,
            Family::Bridge => 7,
            Family::Ip6 => 10,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::Ip => "ip",
            Family::Ip6 => "ip6",
            Family::Inet => "inet",
            Family::Arp => "arp",
            Family::Bridge => "bridge",
            Family::Netdev => "netdev",
        }
    }

    /// 只有单协议族可以从地址推断集合类型 / Only single-protocol families infer a datatype.
    pub fn inferred_datatype(self) -> Option<Datatype> {
        match self {
            Family::Ip => Some(Datatype::Ipv4Addr),
            Family::Ip6 => Some(Datatype::Ipv6Addr),
            _ => None,
        }
    }

    /// 某类地址会被投递到的表族，按顺序 / Families that receive an address kind, in order.
    pub fn routes_for(kind: AddrKind) -> &'static [Family] {
        match kind {
            AddrKind::V4 => &[Family::Ip, Family::Inet, Family::Bridge],
            AddrKind::V6 => &[Family::Ip6, Family::Inet, Family::Bridge],
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrKind {
    V4,
    V6,
}

impl AddrKind {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddrKind::V4,
            IpAddr::V6(_) => AddrKind::V6,
        }
    }
}

/// 集合键类型，保留内核的类型编号 / Set key datatype, keeping the kernel's magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Ipv4Addr,
    Ipv6Addr,
    Other(u32),
}

impl Datatype {
    const MAGIC_IPV4: u32 = 7;
    const MAGIC_IPV6: u32 = 8;

    pub fn from_magic(magic: u32) -> Self {
        match magic {
            Self::MAGIC_IPV4 => Datatype::Ipv4Addr,
            Self::MAGIC_IPV6 => Datatype::Ipv6Addr,
            other => Datatype::Other(other),
        }
    }

    pub fn magic(self) -> u32 {
        match self {
            Datatype::Ipv4Addr => Self::MAGIC_IPV4,
            Datatype::Ipv6Addr => Self::MAGIC_IPV6,
            Datatype::Other(magic) => magic,
        }
    }

    pub fn key_len(self) -> u32 {
        match self {
            Datatype::Ipv4Addr => 4,
            Datatype::Ipv6Addr => 16,
            Datatype::Other(_) => 0,
        }
    }

    pub fn carries(self, kind: AddrKind) -> bool {
        matches!(
            (self, kind),
            (Datatype::Ipv4Addr, AddrKind::V4) | (Datatype::Ipv6Addr, AddrKind::V6)
        )
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datatype::Ipv4Addr => f.write_str("ipv4_addr"),
            Datatype::Ipv6Addr => f.write_str("ipv6_addr"),
            Datatype::Other(magic) => write!(f, "type#{}", magic),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetDescriptor {
    pub name: String,
    pub datatype: Datatype,
    pub interval: bool,
    /// 元素缺省超时 / Default element timeout.
    pub timeout: Option<Duration>,
}

/// 一条打开的内核会话。`add_*` 只排队，`flush` 才提交。
/// One open kernel session. `add_*` only queue work; `flush` commits it as one batch.
pub trait NftConn: Send + 'static {
    fn list_tables(&mut self, family: Family) -> Result<Vec<String>>;

    fn list_sets(&mut self, family: Family, table: &str) -> Result<Vec<SetDescriptor>>;

    fn add_table(&mut self, family: Family, table: &str);

    fn add_set(&mut self, family: Family, table: &str, set: &SetDescriptor);

    fn add_element(&mut self, family: Family, table: &str, set: &SetDescriptor, addr: IpAddr);

    fn flush(&mut self) -> Result<()>;
}

/// 打开内核会话的工厂 / Opens kernel sessions for the pool.
pub trait Connector: Send + Sync + 'static {
    type Conn: NftConn;

    fn connect(&self) -> Result<Self::Conn>;

    /// 配置热加载时调用；新设置只影响之后打开的会话。
    fn reconfigure(&self, _settings: &GlobalSettings) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_single_protocol_families_infer_datatype() {
        assert_eq!(Family::Ip.inferred_datatype(), Some(Datatype::Ipv4Addr));
        assert_eq!(Family::Ip6.inferred_datatype(), Some(Datatype::Ipv6Addr));
        for family in [Family::Inet, Family::Arp, Family::Bridge, Family::Netdev] {
            assert_eq!(family.inferred_datatype(), None, "{}", family);
        }
    }

    #[test]
    fn address_kinds_route_to_matching_families() {
        assert_eq!(
            Family::routes_for(AddrKind::V4),
            &[Family::Ip, Family::Inet, Family::Bridge]
        );
        assert_eq!(
            Family::routes_for(AddrKind::V6),
            &[Family::Ip6, Family::Inet, Family::Bridge]
        );
    }

    #[test]
    fn datatype_guard_is_strict_per_kind() {
        assert!(Datatype::Ipv4Addr.carries(AddrKind::V4));
        assert!(!Datatype::Ipv4Addr.carries(AddrKind::V6));
        assert!(Datatype::Ipv6Addr.carries(AddrKind::V6));
        assert!(!Datatype::Ipv6Addr.carries(AddrKind::V4));
        assert!(!Datatype::Other(13).carries(AddrKind::V4));
        assert_eq!(Datatype::from_magic(7), Datatype::Ipv4Addr);
        assert_eq!(Datatype::from_magic(13).magic(), 13);
    }

    #[test]
    fn family_deserializes_from_lowercase_names() {
        let families: Vec<Family> =
            serde_json::from_str(r#"["ip","ip6","inet","arp","bridge","netdev"]"#).expect("parse");
        assert_eq!(families.len(), 6);
        assert_eq!(families[1], Family::Ip6);
        assert_eq!(families[5].nfproto(), 5);
    }
}
