//! 测试用的内存内核 / In-memory kernel used by tests.

use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{NftError, Result};
use crate::nft::{AddrKind, Connector, Family, NftConn, SetDescriptor};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FakeSet {
    pub desc: SetDescriptor,
    pub elements: Vec<IpAddr>,
}

type Tables = BTreeMap<(Family, String), BTreeMap<String, FakeSet>>;

#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub tables: Tables,
    pub connects: u64,
    pub closed: u64,
    pub table_scans: u64,
    pub set_scans: u64,
    /// 非空批次的提交次数 / Non-empty batches submitted.
    pub flushes: u64,
    pub fail_connect: bool,
    pub fail_flush: bool,
    pub reject_new_sets: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FakeKernel {
    state: Arc<Mutex<FakeState>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_set(self, family: Family, table: &str, desc: SetDescriptor) -> Self {
        self.state()
            .tables
            .entry((family, table.to_string()))
            .or_default()
            .insert(
                desc.name.clone(),
                FakeSet {
                    desc,
                    elements: Vec::new(),
                },
            );
        self
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn has_table(&self, family: Family, table: &str) -> bool {
        self.state()
            .tables
            .contains_key(&(family, table.to_string()))
    }

    pub fn set(&self, family: Family, table: &str, set: &str) -> Option<FakeSet> {
        self.state()
            .tables
            .get(&(family, table.to_string()))
            .and_then(|sets| sets.get(set))
            .cloned()
    }
}

impl Connector for FakeKernel {
    type Conn = FakeConn;

    fn connect(&self) -> Result<FakeConn> {
        let mut state = self.state();
        if state.fail_connect {
            return Err(NftError::Connection(io::Error::other("kernel unreachable")));
        }
        state.connects += 1;
        Ok(FakeConn {
            state: Arc::clone(&self.state),
            pending: Vec::new(),
        })
    }
}

#[derive(Debug)]
enum Op {
    Table(Family, String),
    Set(Family, String, SetDescriptor),
    Element(Family, String, String, IpAddr),
}

#[derive(Debug)]
pub(crate) struct FakeConn {
    state: Arc<Mutex<FakeState>>,
    pending: Vec<Op>,
}

fn errno(op: &'static str, code: i32) -> NftError {
    NftError::kernel(op, io::Error::from_raw_os_error(code))
}

fn apply_op(tables: &mut Tables, op: &Op, reject_new_sets: bool) -> Result<()> {
    match op {
        Op::Table(family, table) => {
            tables.entry((*family, table.clone())).or_default();
        }
        Op::Set(family, table, desc) => {
            let sets = tables
                .get_mut(&(*family, table.clone()))
                .ok_or_else(|| errno("flush", libc::ENOENT))?;
            if !sets.contains_key(&desc.name) {
                if reject_new_sets {
                    return Err(errno("flush", libc::EINVAL));
                }
                sets.insert(
                    desc.name.clone(),
                    FakeSet {
                        desc: desc.clone(),
                        elements: Vec::new(),
                    },
                );
            }
        }
        Op::Element(family, table, set, addr) => {
            let set = tables
                .get_mut(&(*family, table.clone()))
                .and_then(|sets| sets.get_mut(set))
                .ok_or_else(|| errno("flush", libc::ENOENT))?;
            if !set.desc.datatype.carries(AddrKind::of(addr)) {
                return Err(errno("flush", libc::EINVAL));
            }
            if !set.elements.contains(addr) {
                set.elements.push(*addr);
            }
        }
    }
    Ok(())
}

impl NftConn for FakeConn {
    fn list_tables(&mut self, family: Family) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.table_scans += 1;
        Ok(state
            .tables
            .keys()
            .filter(|(f, _)| *f == family)
            .map(|(_, name)| name.clone())
            .collect())
    }

    fn list_sets(&mut self, family: Family, table: &str) -> Result<Vec<SetDescriptor>> {
        let mut state = self.state.lock().unwrap();
        state.set_scans += 1;
        Ok(state
            .tables
            .get(&(family, table.to_string()))
            .map(|sets| sets.values().map(|s| s.desc.clone()).collect())
            .unwrap_or_default())
    }

    fn add_table(&mut self, family: Family, table: &str) {
        self.pending.push(Op::Table(family, table.to_string()));
    }

    fn add_set(&mut self, family: Family, table: &str, set: &SetDescriptor) {
        self.pending
            .push(Op::Set(family, table.to_string(), set.clone()));
    }

    fn add_element(&mut self, family: Family, table: &str, set: &SetDescriptor, addr: IpAddr) {
        self.pending.push(Op::Element(
            family,
            table.to_string(),
            set.name.clone(),
            addr,
        ));
    }

    /// 与内核批处理一致：全部成功才生效 / All-or-nothing, like a kernel batch.
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        let mut state = self.state.lock().unwrap();
        state.flushes += 1;
        if state.fail_flush {
            return Err(errno("flush", libc::EIO));
        }
        let mut staged = state.tables.clone();
        for op in &ops {
            apply_op(&mut staged, op, state.reject_new_sets)?;
        }
        state.tables = staged;
        Ok(())
    }
}

impl Drop for FakeConn {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed += 1;
        }
    }
}
