use std::fmt;
use std::net::IpAddr;

use tracing::debug;

use crate::error::Result;
use crate::nft::{AddrKind, NftConn};
use crate::pool::Session;
use crate::rules::RuleTarget;

/// 非错误的跳过原因，仅以 debug 记录 / Non-error skip reasons, logged at debug only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DatatypeMismatch,
    Uninferrable,
    RetryLimited,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::DatatypeMismatch => "datatype_mismatch",
            SkipReason::Uninferrable => "uninferrable",
            SkipReason::RetryLimited => "retry_limited",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Skipped(SkipReason),
}

/// 把一个地址写入一个集合目标，必要时先建表建集合。
///
/// 每个元素单独提交，失败能精确归因到目标；flush 失败会让会话出错。
/// Inserts one address into one target, creating the table and set on first
/// use. Each element is committed on its own so a failure maps to exactly one
/// target.
pub fn apply<C: NftConn>(
    session: &mut Session<C>,
    target: &RuleTarget,
    addr: IpAddr,
) -> Result<ApplyOutcome> {
    let kind = AddrKind::of(&addr);
    let table = session.resolve_table(target.family, &target.table)?;

    let set = match session.resolve_set(&table, &target.set)? {
        Some(existing) => {
            if !existing.datatype.carries(kind) {
                debug!(
                    family = %target.family,
                    table = %target.table,
                    set = %target.set,
                    datatype = %existing.datatype,
                    addr = %addr,
                    "set datatype does not carry address, skipped"
                );
                return Ok(ApplyOutcome::Skipped(SkipReason::DatatypeMismatch));
            }
            existing
        }
        None => {
            let Some(datatype) = target.effective_datatype() else {
                debug!(
                    family = %target.family,
                    table = %target.table,
                    set = %target.set,
                    "set datatype cannot be inferred, skipped"
                );
                return Ok(ApplyOutcome::Skipped(SkipReason::Uninferrable));
            };
            if !datatype.carries(kind) {
                debug!(
                    family = %target.family,
                    table = %target.table,
                    set = %target.set,
                    datatype = %datatype,
                    addr = %addr,
                    "configured datatype does not carry address, skipped"
                );
                return Ok(ApplyOutcome::Skipped(SkipReason::DatatypeMismatch));
            }
            let desc = target.descriptor(datatype);
            debug!(
                family = %target.family,
                table = %target.table,
                set = %target.set,
                datatype = %datatype,
                interval = desc.interval,
                "creating nftables set"
            );
            session.queue_set(&table, desc.clone());
            desc
        }
    };

    session.queue_element(&table, &set, addr);
    session.flush()?;
    Ok(ApplyOutcome::Applied)
}
