use std::collections::hash_map::Entry;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::Result;
use crate::nft::{Family, NftConn, SetDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableHandle {
    pub family: Family,
    pub name: Arc<str>,
}

#[derive(Debug)]
struct CachedTable {
    handle: TableHandle,
    // None: 尚未枚举 / not enumerated yet
    sets: Option<FxHashMap<String, SetDescriptor>>,
}

#[derive(Debug)]
enum Pending {
    Table(Family, Arc<str>),
    Set(Family, Arc<str>, String),
}

/// 单个会话内的表/集合元数据缓存。
///
/// 每个表族在会话生命周期内只枚举一次，每个已存在的表只枚举一次集合；
/// 之后内核状态的带外变化不会被察觉，过期时间受会话 TTL 约束。
/// Per-session table/set metadata. Each family is enumerated once per session
/// and each pre-existing table has its sets enumerated once.
#[derive(Debug, Default)]
pub struct TableCache {
    families: FxHashMap<Family, FxHashMap<Arc<str>, CachedTable>>,
    // 乐观创建、尚未被 flush 确认的对象 / Optimistic creations awaiting a flush.
    pending: Vec<Pending>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve_table<C: NftConn>(
        &mut self,
        conn: &mut C,
        family: Family,
        name: &str,
    ) -> Result<TableHandle> {
        let tables = match self.families.entry(family) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let names = conn.list_tables(family)?;
                debug!(family = %family, count = names.len(), "nftables tables enumerated");
                let tables = names
                    .into_iter()
                    .map(|table| {
                        let name: Arc<str> = Arc::from(table);
                        let cached = CachedTable {
                            handle: TableHandle {
                                family,
                                name: name.clone(),
                            },
                            sets: None,
                        };
                        (name, cached)
                    })
                    .collect();
                entry.insert(tables)
            }
        };

        if let Some(cached) = tables.get(name) {
            return Ok(cached.handle.clone());
        }

        debug!(family = %family, table = %name, "nftables table not found, creating");
        conn.add_table(family, name);
        let handle = TableHandle {
            family,
            name: Arc::from(name),
        };
        tables.insert(
            handle.name.clone(),
            CachedTable {
                handle: handle.clone(),
                // 新建的表一定是空的 / A table we create starts empty.
                sets: Some(FxHashMap::default()),
            },
        );
        self.pending.push(Pending::Table(family, handle.name.clone()));
        Ok(handle)
    }

    pub fn resolve_set<C: NftConn>(
        &mut self,
        conn: &mut C,
        table: &TableHandle,
        name: &str,
    ) -> Result<Option<SetDescriptor>> {
        let Some(cached) = self
            .families
            .get_mut(&table.family)
            .and_then(|tables| tables.get_mut(&*table.name))
        else {
            return Ok(None);
        };

        if cached.sets.is_none() {
            let listed = conn.list_sets(table.family, &table.name)?;
            debug!(
                family = %table.family,
                table = %table.name,
                count = listed.len(),
                "nftables sets enumerated"
            );
            cached.sets = Some(
                listed
                    .into_iter()
                    .map(|set| (set.name.clone(), set))
                    .collect(),
            );
        }

        Ok(cached
            .sets
            .as_ref()
            .and_then(|sets| sets.get(name))
            .cloned())
    }

    /// 记录本会话刚排队创建的集合 / Remember a set this session just queued for creation.
    pub fn remember_set(&mut self, table: &TableHandle, set: SetDescriptor) {
        let Some(cached) = self
            .families
            .get_mut(&table.family)
            .and_then(|tables| tables.get_mut(&*table.name))
        else {
            return;
        };
        self.pending.push(Pending::Set(
            table.family,
            table.name.clone(),
            set.name.clone(),
        ));
        cached
            .sets
            .get_or_insert_with(FxHashMap::default)
            .insert(set.name.clone(), set);
    }

    pub fn commit(&mut self) {
        self.pending.clear();
    }

    /// flush 失败：丢弃内核拒绝的乐观条目 / Drop optimistic entries the kernel rejected.
    pub fn rollback(&mut self) {
        while let Some(pending) = self.pending.pop() {
            match pending {
                Pending::Set(family, table, set) => {
                    if let Some(sets) = self
                        .families
                        .get_mut(&family)
                        .and_then(|tables| tables.get_mut(&table))
                        .and_then(|cached| cached.sets.as_mut())
                    {
                        sets.remove(&set);
                    }
                }
                Pending::Table(family, table) => {
                    if let Some(tables) = self.families.get_mut(&family) {
                        tables.remove(&table);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
