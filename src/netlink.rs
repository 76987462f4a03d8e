use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::config::GlobalSettings;
use crate::error::{NftError, Result};
use crate::nfnl::{self, MsgKind, NlMsg, NlWriter};
use crate::nft::{Connector, Datatype, Family, NftConn, SetDescriptor};

const RECV_BUF_SIZE: usize = 64 * 1024;
/// 内核应答等待上限，避免阻塞线程永久挂起 / Upper bound on waiting for a kernel reply.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// 通过 NETLINK_NETFILTER 打开会话 / Opens sessions over NETLINK_NETFILTER.
#[derive(Debug, Default)]
pub struct NetlinkConnector {
    isolate_namespace: AtomicBool,
}

impl NetlinkConnector {
    pub fn new(isolate_namespace: bool) -> Self {
        Self {
            isolate_namespace: AtomicBool::new(isolate_namespace),
        }
    }
}

impl Connector for NetlinkConnector {
    type Conn = NetlinkConn;

    fn connect(&self) -> Result<NetlinkConn> {
        if self.isolate_namespace.load(Ordering::Relaxed) {
            NetlinkConn::open_isolated()
        } else {
            NetlinkConn::open()
        }
    }

    fn reconfigure(&self, settings: &GlobalSettings) {
        self.isolate_namespace
            .store(settings.isolate_namespace, Ordering::Relaxed);
    }
}

pub struct NetlinkConn {
    socket: Socket,
    // 隔离模式下持有命名空间 / Keeps the isolated namespace alive.
    netns: Option<File>,
    seq: u32,
    next_set_id: u32,
    batch: NlWriter,
    batch_seqs: Vec<u32>,
    recv_buf: Vec<u8>,
}

fn open_socket() -> io::Result<Socket> {
    let socket = Socket::new(
        Domain::from(libc::AF_NETLINK),
        Type::from(libc::SOCK_RAW),
        Some(Protocol::from(libc::NETLINK_NETFILTER)),
    )?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    Ok(socket)
}

impl NetlinkConn {
    pub fn open() -> Result<Self> {
        let socket = open_socket().map_err(NftError::Connection)?;
        Ok(Self::with_socket(socket, None))
    }

    /// 在新建的网络命名空间里打开 socket。unshare 只影响调用线程，
    /// 因此放在一次性线程中执行；线程退出后命名空间由 socket 与 fd 保持。
    pub fn open_isolated() -> Result<Self> {
        let handle = thread::Builder::new()
            .name("nft-netns".to_string())
            .spawn(|| -> io::Result<(Socket, File)> {
                let ret = unsafe { libc::unshare(libc::CLONE_NEWNET) };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                let netns = File::open("/proc/thread-self/ns/net")?;
                let socket = open_socket()?;
                Ok((socket, netns))
            })
            .map_err(NftError::Connection)?;
        let (socket, netns) = handle
            .join()
            .map_err(|_| NftError::Connection(io::Error::other("netns setup thread panicked")))?
            .map_err(NftError::Connection)?;
        Ok(Self::with_socket(socket, Some(netns)))
    }

    fn with_socket(socket: Socket, netns: Option<File>) -> Self {
        Self {
            socket,
            netns,
            seq: 0,
            next_set_id: 0,
            batch: NlWriter::new(),
            batch_seqs: Vec::new(),
            recv_buf: vec![0u8; RECV_BUF_SIZE],
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn dump<F>(&mut self, op: &'static str, request: &NlWriter, seq: u32, mut on_msg: F) -> Result<()>
    where
        F: FnMut(&NlMsg<'_>),
    {
        self.socket
            .send(request.as_bytes())
            .map_err(|err| NftError::kernel(op, err))?;
        loop {
            let n = (&self.socket)
                .read(&mut self.recv_buf)
                .map_err(|err| NftError::kernel(op, err))?;
            for msg in nfnl::messages(&self.recv_buf[..n]) {
                // 丢弃之前请求遗留的应答 / Drop leftovers of earlier requests.
                if msg.seq != seq {
                    continue;
                }
                match msg.kind() {
                    MsgKind::Done => return Ok(()),
                    MsgKind::Error(0) | MsgKind::Noop => {}
                    MsgKind::Error(code) => {
                        return Err(NftError::kernel(op, io::Error::from_raw_os_error(-code)));
                    }
                    _ => on_msg(&msg),
                }
            }
        }
    }
}

impl NftConn for NetlinkConn {
    fn list_tables(&mut self, family: Family) -> Result<Vec<String>> {
        let seq = self.next_seq();
        let mut req = NlWriter::new();
        encode_dump(&mut req, nfnl::NFT_MSG_GETTABLE, seq, family, None);
        let mut names = Vec::new();
        self.dump("list tables", &req, seq, |msg| {
            if let Some(name) = parse_table_name(msg) {
                names.push(name);
            }
        })?;
        Ok(names)
    }

    fn list_sets(&mut self, family: Family, table: &str) -> Result<Vec<SetDescriptor>> {
        let seq = self.next_seq();
        let mut req = NlWriter::new();
        encode_dump(&mut req, nfnl::NFT_MSG_GETSET, seq, family, Some(table));
        let mut sets = Vec::new();
        self.dump("list sets", &req, seq, |msg| {
            if let Some(set) = parse_set(msg) {
                sets.push(set);
            }
        })?;
        Ok(sets)
    }

    fn add_table(&mut self, family: Family, table: &str) {
        let seq = self.next_seq();
        encode_new_table(&mut self.batch, seq, family, table);
        self.batch_seqs.push(seq);
    }

    fn add_set(&mut self, family: Family, table: &str, set: &SetDescriptor) {
        let seq = self.next_seq();
        self.next_set_id = self.next_set_id.wrapping_add(1);
        encode_new_set(&mut self.batch, seq, family, table, set, self.next_set_id);
        self.batch_seqs.push(seq);
    }

    fn add_element(&mut self, family: Family, table: &str, set: &SetDescriptor, addr: IpAddr) {
        let seq = self.next_seq();
        encode_new_element(&mut self.batch, seq, family, table, set, addr);
        self.batch_seqs.push(seq);
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch_seqs.is_empty() {
            return Ok(());
        }
        let begin_seq = self.next_seq();
        let end_seq = self.next_seq();
        let mut out = NlWriter::new();
        out.batch_begin(begin_seq);
        out.append(&self.batch);
        out.batch_end(end_seq);
        self.batch.clear();
        let mut pending = std::mem::take(&mut self.batch_seqs);

        self.socket
            .send(out.as_bytes())
            .map_err(|err| NftError::kernel("flush", err))?;

        // 每条命令都带 NLM_F_ACK：收齐应答或遇到第一个错误即结束
        while !pending.is_empty() {
            let n = (&self.socket)
                .read(&mut self.recv_buf)
                .map_err(|err| NftError::kernel("flush", err))?;
            for msg in nfnl::messages(&self.recv_buf[..n]) {
                let MsgKind::Error(code) = msg.kind() else {
                    continue;
                };
                let Some(pos) = pending.iter().position(|seq| *seq == msg.seq) else {
                    continue;
                };
                pending.swap_remove(pos);
                if code != 0 {
                    return Err(NftError::kernel(
                        "flush",
                        io::Error::from_raw_os_error(-code),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Drop for NetlinkConn {
    fn drop(&mut self) {
        if !self.batch_seqs.is_empty() {
            warn!(
                pending = self.batch_seqs.len(),
                "nftables connection closed with unflushed commands"
            );
        }
        if self.netns.is_some() {
            debug!("nftables isolated namespace released");
        }
    }
}

fn encode_dump(w: &mut NlWriter, msg: u16, seq: u32, family: Family, table: Option<&str>) {
    let start = w.begin(
        nfnl::nft_type(msg),
        nfnl::NLM_F_REQUEST | nfnl::NLM_F_DUMP,
        seq,
        family.nfproto(),
        0,
    );
    if let Some(table) = table {
        w.put_str(nfnl::NFTA_SET_TABLE, table);
    }
    w.end(start);
}

fn encode_new_table(w: &mut NlWriter, seq: u32, family: Family, table: &str) {
    let start = w.begin(
        nfnl::nft_type(nfnl::NFT_MSG_NEWTABLE),
        nfnl::NLM_F_REQUEST | nfnl::NLM_F_CREATE | nfnl::NLM_F_ACK,
        seq,
        family.nfproto(),
        0,
    );
    w.put_str(nfnl::NFTA_TABLE_NAME, table);
    w.put_be32(nfnl::NFTA_TABLE_FLAGS, 0);
    w.end(start);
}

fn encode_new_set(
    w: &mut NlWriter,
    seq: u32,
    family: Family,
    table: &str,
    set: &SetDescriptor,
    set_id: u32,
) {
    let mut flags = 0;
    if set.interval {
        flags |= nfnl::NFT_SET_INTERVAL;
    }
    if set.timeout.is_some() {
        flags |= nfnl::NFT_SET_TIMEOUT;
    }
    let start = w.begin(
        nfnl::nft_type(nfnl::NFT_MSG_NEWSET),
        nfnl::NLM_F_REQUEST | nfnl::NLM_F_CREATE | nfnl::NLM_F_ACK,
        seq,
        family.nfproto(),
        0,
    );
    w.put_str(nfnl::NFTA_SET_TABLE, table);
    w.put_str(nfnl::NFTA_SET_NAME, &set.name);
    w.put_be32(nfnl::NFTA_SET_FLAGS, flags);
    w.put_be32(nfnl::NFTA_SET_KEY_TYPE, set.datatype.magic());
    w.put_be32(nfnl::NFTA_SET_KEY_LEN, set.datatype.key_len());
    w.put_be32(nfnl::NFTA_SET_ID, set_id);
    if let Some(timeout) = set.timeout {
        w.put_be64(nfnl::NFTA_SET_TIMEOUT, timeout.as_millis() as u64);
    }
    w.end(start);
}

/// 区间集合里单个地址写成 [addr, addr+1) / A single address in an interval set is [addr, addr+1).
fn encode_new_element(
    w: &mut NlWriter,
    seq: u32,
    family: Family,
    table: &str,
    set: &SetDescriptor,
    addr: IpAddr,
) {
    let start = w.begin(
        nfnl::nft_type(nfnl::NFT_MSG_NEWSETELEM),
        nfnl::NLM_F_REQUEST | nfnl::NLM_F_CREATE | nfnl::NLM_F_ACK,
        seq,
        family.nfproto(),
        0,
    );
    w.put_str(nfnl::NFTA_SET_ELEM_LIST_TABLE, table);
    w.put_str(nfnl::NFTA_SET_ELEM_LIST_SET, &set.name);
    let elements = w.nest_start(nfnl::NFTA_SET_ELEM_LIST_ELEMENTS);
    put_element(w, &addr_bytes(addr), 0);
    if set.interval {
        if let Some(end) = next_addr(addr) {
            put_element(w, &addr_bytes(end), nfnl::NFT_SET_ELEM_INTERVAL_END);
        }
    }
    w.nest_end(elements);
    w.end(start);
}

fn put_element(w: &mut NlWriter, key: &[u8], flags: u32) {
    let elem = w.nest_start(nfnl::NFTA_LIST_ELEM);
    let key_nest = w.nest_start(nfnl::NFTA_SET_ELEM_KEY);
    w.put(nfnl::NFTA_DATA_VALUE, key);
    w.nest_end(key_nest);
    if flags != 0 {
        w.put_be32(nfnl::NFTA_SET_ELEM_FLAGS, flags);
    }
    w.nest_end(elem);
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn next_addr(addr: IpAddr) -> Option<IpAddr> {
    match addr {
        IpAddr::V4(v4) => u32::from(v4)
            .checked_add(1)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(v6) => u128::from(v6)
            .checked_add(1)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

fn parse_table_name(msg: &NlMsg<'_>) -> Option<String> {
    if msg.kind() != MsgKind::Nft(nfnl::NFT_MSG_NEWTABLE) {
        return None;
    }
    msg.nft_attrs()
        .find(|(ty, _)| *ty == nfnl::NFTA_TABLE_NAME)
        .and_then(|(_, payload)| nfnl::attr_str(payload))
        .map(str::to_string)
}

fn parse_set(msg: &NlMsg<'_>) -> Option<SetDescriptor> {
    if msg.kind() != MsgKind::Nft(nfnl::NFT_MSG_NEWSET) {
        return None;
    }
    let mut name = None;
    let mut flags = 0;
    let mut key_type = 0;
    let mut timeout_ms = 0;
    for (ty, payload) in msg.nft_attrs() {
        match ty {
            nfnl::NFTA_SET_NAME => name = nfnl::attr_str(payload).map(str::to_string),
            nfnl::NFTA_SET_FLAGS => flags = nfnl::attr_be32(payload).unwrap_or(0),
            nfnl::NFTA_SET_KEY_TYPE => key_type = nfnl::attr_be32(payload).unwrap_or(0),
            nfnl::NFTA_SET_TIMEOUT => timeout_ms = nfnl::attr_be64(payload).unwrap_or(0),
            _ => {}
        }
    }
    // 匿名集合属于规则内部 / Anonymous sets belong to rules.
    if flags & nfnl::NFT_SET_ANONYMOUS != 0 {
        return None;
    }
    Some(SetDescriptor {
        name: name?,
        datatype: Datatype::from_magic(key_type),
        interval: flags & nfnl::NFT_SET_INTERVAL != 0,
        timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nfnl::Attrs;

    fn descriptor(interval: bool, timeout: Option<Duration>) -> SetDescriptor {
        SetDescriptor {
            name: "s".to_string(),
            datatype: Datatype::Ipv4Addr,
            interval,
            timeout,
        }
    }

    #[test]
    fn new_set_message_reads_back_as_kernel_dump_entry() {
        let mut w = NlWriter::new();
        let set = descriptor(true, Some(Duration::from_secs(60)));
        encode_new_set(&mut w, 5, Family::Ip, "t", &set, 1);

        let msg = nfnl::messages(w.as_bytes()).next().expect("one message");
        assert_eq!(msg.family(), Some(Family::Ip.nfproto()));
        assert_ne!(msg.flags & nfnl::NLM_F_ACK, 0);
        assert_eq!(parse_set(&msg), Some(set));
    }

    #[test]
    fn interval_element_adds_range_end() {
        let mut w = NlWriter::new();
        let addr: IpAddr = "1.2.3.4".parse().unwrap();
        encode_new_element(&mut w, 1, Family::Ip, "t", &descriptor(true, None), addr);

        let msg = nfnl::messages(w.as_bytes()).next().expect("message");
        let (_, elements) = msg
            .nft_attrs()
            .find(|(ty, _)| *ty == nfnl::NFTA_SET_ELEM_LIST_ELEMENTS)
            .expect("elements");
        let elems: Vec<_> = Attrs::new(elements).collect();
        assert_eq!(elems.len(), 2);

        let key_of = |elem: &[u8]| -> Vec<u8> {
            let (_, key) = Attrs::new(elem)
                .find(|(ty, _)| *ty == nfnl::NFTA_SET_ELEM_KEY)
                .expect("key");
            let (_, value) = Attrs::new(key).next().expect("value");
            value.to_vec()
        };
        assert_eq!(key_of(elems[0].1), vec![1, 2, 3, 4]);
        assert_eq!(key_of(elems[1].1), vec![1, 2, 3, 5]);
        let end_flags = Attrs::new(elems[1].1)
            .find(|(ty, _)| *ty == nfnl::NFTA_SET_ELEM_FLAGS)
            .and_then(|(_, p)| nfnl::attr_be32(p));
        assert_eq!(end_flags, Some(nfnl::NFT_SET_ELEM_INTERVAL_END));
    }

    #[test]
    fn plain_set_element_has_single_key() {
        let mut w = NlWriter::new();
        let addr: IpAddr = "2001:db8::1".parse().unwrap();
        let mut set = descriptor(false, None);
        set.datatype = Datatype::Ipv6Addr;
        encode_new_element(&mut w, 1, Family::Ip6, "t", &set, addr);

        let msg = nfnl::messages(w.as_bytes()).next().expect("message");
        let (_, elements) = msg
            .nft_attrs()
            .find(|(ty, _)| *ty == nfnl::NFTA_SET_ELEM_LIST_ELEMENTS)
            .expect("elements");
        assert_eq!(Attrs::new(elements).count(), 1);
    }

    #[test]
    fn range_end_is_omitted_at_address_space_top() {
        assert_eq!(next_addr("255.255.255.255".parse().unwrap()), None);
        assert_eq!(
            next_addr("10.0.0.255".parse().unwrap()),
            Some("10.0.1.0".parse().unwrap())
        );
        assert_eq!(next_addr(IpAddr::V6(Ipv6Addr::from(u128::MAX))), None);
    }

    #[test]
    fn anonymous_sets_are_not_reported() {
        let mut w = NlWriter::new();
        let start = w.begin(nfnl::nft_type(nfnl::NFT_MSG_NEWSET), 0, 1, 2, 0);
        w.put_str(nfnl::NFTA_SET_NAME, "__set0");
        w.put_be32(nfnl::NFTA_SET_FLAGS, nfnl::NFT_SET_ANONYMOUS | nfnl::NFT_SET_INTERVAL);
        w.put_be32(nfnl::NFTA_SET_KEY_TYPE, 7);
        w.end(start);
        let msg = nfnl::messages(w.as_bytes()).next().expect("message");
        assert_eq!(parse_set(&msg), None);
    }

    #[test]
    fn table_dump_entry_yields_name() {
        let mut w = NlWriter::new();
        encode_new_table(&mut w, 3, Family::Inet, "filter");
        let msg = nfnl::messages(w.as_bytes()).next().expect("message");
        assert_eq!(parse_table_name(&msg).as_deref(), Some("filter"));
    }
}
