//! nftdns: 把 DNS 应答中的 A/AAAA 地址写入 nftables 集合。
//!
//! Programs the addresses of completed DNS answers into live nftables sets.

pub mod answer;
pub mod applier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod netlink;
pub mod nfnl;
pub mod nft;
pub mod pool;
pub mod retry;
pub mod rules;
pub mod table_cache;
pub mod watcher;

#[cfg(test)]
mod fake;

pub use answer::{AnswerRecord, AnswerSet, RecordData};
pub use dispatcher::{Dispatcher, ServeContext};
pub use error::NftError;
pub use netlink::NetlinkConnector;
