use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::Result;
use crate::nft::{Connector, Family, NftConn, SetDescriptor};
use crate::table_cache::{TableCache, TableHandle};

/// 一条被独占借出的内核会话 / A kernel session, exclusively owned while borrowed.
#[derive(Debug)]
pub struct Session<C: NftConn> {
    id: u64,
    conn: C,
    created: Instant,
    // 粘滞错误：置位后不再归还池中
    errored: bool,
    tables: TableCache,
}

impl<C: NftConn> Session<C> {
    fn new(id: u64, conn: C) -> Self {
        Self {
            id,
            conn,
            created: Instant::now(),
            errored: false,
            tables: TableCache::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    pub fn mark_errored(&mut self) {
        self.errored = true;
    }

    pub fn resolve_table(&mut self, family: Family, name: &str) -> Result<TableHandle> {
        let res = self.tables.resolve_table(&mut self.conn, family, name);
        if res.is_err() {
            self.errored = true;
        }
        res
    }

    pub fn resolve_set(&mut self, table: &TableHandle, name: &str) -> Result<Option<SetDescriptor>> {
        let res = self.tables.resolve_set(&mut self.conn, table, name);
        if res.is_err() {
            self.errored = true;
        }
        res
    }

    /// 排队创建集合并记入缓存（flush 失败时回滚）。
    pub fn queue_set(&mut self, table: &TableHandle, set: SetDescriptor) {
        self.conn.add_set(table.family, &table.name, &set);
        self.tables.remember_set(table, set);
    }

    pub fn queue_element(&mut self, table: &TableHandle, set: &SetDescriptor, addr: IpAddr) {
        self.conn.add_element(table.family, &table.name, set, addr);
    }

    /// 提交排队的命令；失败会标记会话出错并丢弃未确认的元数据。
    pub fn flush(&mut self) -> Result<()> {
        match self.conn.flush() {
            Ok(()) => {
                self.tables.commit();
                Ok(())
            }
            Err(err) => {
                self.tables.rollback();
                self.errored = true;
                Err(err)
            }
        }
    }
}

impl<C: NftConn> Drop for Session<C> {
    fn drop(&mut self) {
        debug!(session = self.id, errored = self.errored, "nftables session closed");
    }
}

/// 空闲会话池，只以 TTL 为界 / Idle session pool, bounded only by TTL.
pub struct Pool<K: Connector> {
    connector: K,
    idle: Mutex<VecDeque<Session<K::Conn>>>,
    ttl_ms: AtomicU64,
    next_id: AtomicU64,
    opened: AtomicU64,
}

impl<K: Connector> Pool<K> {
    pub fn new(connector: K, ttl: Duration) -> Self {
        Self {
            connector,
            idle: Mutex::new(VecDeque::new()),
            ttl_ms: AtomicU64::new(ttl.as_millis().min(u64::MAX as u128) as u64),
            next_id: AtomicU64::new(1),
            opened: AtomicU64::new(0),
        }
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms
            .store(ttl.as_millis().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    #[inline]
    fn expired(&self, session: &Session<K::Conn>) -> bool {
        let ttl = self.ttl();
        ttl.is_zero() || session.age() > ttl
    }

    /// 取出最老的未过期会话，没有则新建；从不等待。
    /// Pops the oldest live session or opens a new one; never waits.
    pub fn acquire(&self) -> Result<Session<K::Conn>> {
        let mut expired = Vec::new();
        let found = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            let mut found = None;
            while let Some(session) = idle.pop_front() {
                if self.expired(&session) {
                    expired.push(session);
                } else {
                    found = Some(session);
                    break;
                }
            }
            found
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "retiring expired nftables sessions");
            retire(expired);
        }
        if let Some(session) = found {
            debug!(session = session.id, "nftables session reused");
            return Ok(session);
        }

        let conn = self.connector.connect()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "nftables session opened");
        Ok(Session::new(id, conn))
    }

    /// 提交剩余命令后归还；出错或过期的会话被销毁。
    pub fn release(&self, mut session: Session<K::Conn>) {
        if let Err(err) = session.flush() {
            warn!(session = session.id, error = %err, "nftables flush on release failed");
        }
        if session.is_errored() || self.expired(&session) {
            retire(vec![session]);
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(session);
    }

    pub fn drain(&self) {
        let sessions: Vec<_> = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.drain(..).collect()
        };
        if !sessions.is_empty() {
            debug!(count = sessions.len(), "nftables pool drained");
            retire(sessions);
        }
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// 关闭连接（及命名空间句柄）放到关键路径之外。
fn retire<C: NftConn>(sessions: Vec<Session<C>>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || drop(sessions));
        }
        Err(_) => drop(sessions),
    }
}
