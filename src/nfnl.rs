//! nfnetlink / nf_tables 报文编解码 / nfnetlink and nf_tables message codec.
//!
//! 只覆盖集合编程所需的子集：批处理包裹、NEWTABLE、NEWSET、NEWSETELEM，
//! 以及 GETTABLE/GETSET 转储和 NLMSG_ERROR 应答。
//! Only the subset needed to program sets is covered.

pub const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDRLEN: usize = 4;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_ACK: u16 = 0x4;
pub const NLM_F_DUMP: u16 = 0x300;
pub const NLM_F_CREATE: u16 = 0x400;

const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_F_NET_BYTEORDER: u16 = 0x4000;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

const NFNETLINK_V0: u8 = 0;
const NFNL_SUBSYS_NFTABLES: u16 = 10;
const NFNL_MSG_BATCH_BEGIN: u16 = 0x10;
const NFNL_MSG_BATCH_END: u16 = 0x11;
const AF_UNSPEC: u8 = 0;

pub const NFT_MSG_NEWTABLE: u16 = 0;
pub const NFT_MSG_GETTABLE: u16 = 1;
pub const NFT_MSG_NEWSET: u16 = 9;
pub const NFT_MSG_GETSET: u16 = 10;
pub const NFT_MSG_NEWSETELEM: u16 = 12;

pub const NFTA_TABLE_NAME: u16 = 1;
pub const NFTA_TABLE_FLAGS: u16 = 2;

pub const NFTA_SET_TABLE: u16 = 1;
pub const NFTA_SET_NAME: u16 = 2;
pub const NFTA_SET_FLAGS: u16 = 3;
pub const NFTA_SET_KEY_TYPE: u16 = 4;
pub const NFTA_SET_KEY_LEN: u16 = 5;
pub const NFTA_SET_ID: u16 = 10;
pub const NFTA_SET_TIMEOUT: u16 = 11;

pub const NFT_SET_ANONYMOUS: u32 = 0x1;
pub const NFT_SET_INTERVAL: u32 = 0x4;
pub const NFT_SET_TIMEOUT: u32 = 0x10;

pub const NFTA_SET_ELEM_LIST_TABLE: u16 = 1;
pub const NFTA_SET_ELEM_LIST_SET: u16 = 2;
pub const NFTA_SET_ELEM_LIST_ELEMENTS: u16 = 3;
pub const NFTA_LIST_ELEM: u16 = 1;
pub const NFTA_SET_ELEM_KEY: u16 = 1;
pub const NFTA_SET_ELEM_FLAGS: u16 = 3;
pub const NFTA_DATA_VALUE: u16 = 1;
pub const NFT_SET_ELEM_INTERVAL_END: u32 = 0x1;

/// nf_tables 子系统内的消息类型 / Message type within the nf_tables subsystem.
#[inline]
pub const fn nft_type(msg: u16) -> u16 {
    (NFNL_SUBSYS_NFTABLES << 8) | msg
}

#[inline]
const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// 追加式报文写入器，多条消息可以连续写入同一缓冲区（批处理）。
#[derive(Debug, Default)]
pub struct NlWriter {
    buf: Vec<u8>,
}

impl NlWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(512),
        }
    }

    /// 写入 nlmsghdr 与 nfgenmsg，返回消息起点，完成后需调用 [`NlWriter::end`]。
    pub fn begin(&mut self, msg_type: u16, flags: u16, seq: u32, family: u8, res_id: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u32.to_ne_bytes());
        self.buf.extend_from_slice(&msg_type.to_ne_bytes());
        self.buf.extend_from_slice(&flags.to_ne_bytes());
        self.buf.extend_from_slice(&seq.to_ne_bytes());
        // portid 0: 由内核分配
        self.buf.extend_from_slice(&0u32.to_ne_bytes());
        self.buf.push(family);
        self.buf.push(NFNETLINK_V0);
        self.buf.extend_from_slice(&res_id.to_be_bytes());
        start
    }

    pub fn end(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u32;
        self.buf[start..start + 4].copy_from_slice(&len.to_ne_bytes());
    }

    pub fn batch_begin(&mut self, seq: u32) {
        let start = self.begin(
            NFNL_MSG_BATCH_BEGIN,
            NLM_F_REQUEST,
            seq,
            AF_UNSPEC,
            NFNL_SUBSYS_NFTABLES,
        );
        self.end(start);
    }

    pub fn batch_end(&mut self, seq: u32) {
        let start = self.begin(
            NFNL_MSG_BATCH_END,
            NLM_F_REQUEST,
            seq,
            AF_UNSPEC,
            NFNL_SUBSYS_NFTABLES,
        );
        self.end(start);
    }

    pub fn put(&mut self, attr_type: u16, payload: &[u8]) {
        self.put_header(attr_type, NLA_HDRLEN + payload.len());
        self.buf.extend_from_slice(payload);
        self.pad();
    }

    /// 字符串属性以 NUL 结尾 / String attributes are NUL terminated.
    pub fn put_str(&mut self, attr_type: u16, value: &str) {
        self.put_header(attr_type, NLA_HDRLEN + value.len() + 1);
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self.pad();
    }

    pub fn put_be32(&mut self, attr_type: u16, value: u32) {
        self.put(attr_type, &value.to_be_bytes());
    }

    pub fn put_be64(&mut self, attr_type: u16, value: u64) {
        self.put(attr_type, &value.to_be_bytes());
    }

    pub fn nest_start(&mut self, attr_type: u16) -> usize {
        let start = self.buf.len();
        self.put_header(attr_type | NLA_F_NESTED, NLA_HDRLEN);
        start
    }

    pub fn nest_end(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    pub fn append(&mut self, other: &NlWriter) {
        self.buf.extend_from_slice(&other.buf);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn put_header(&mut self, attr_type: u16, len: usize) {
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
    }

    fn pad(&mut self) {
        let padded = align4(self.buf.len());
        self.buf.resize(padded, 0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Noop,
    Done,
    /// 负的 errno，0 表示确认成功 / Negative errno, 0 is a plain ack.
    Error(i32),
    Nft(u16),
    Other(u16),
}

/// 从接收缓冲区借用的一条消息，零拷贝 / One message borrowed from the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct NlMsg<'a> {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: &'a [u8],
}

impl<'a> NlMsg<'a> {
    pub fn kind(&self) -> MsgKind {
        match self.msg_type {
            NLMSG_NOOP => MsgKind::Noop,
            NLMSG_DONE => MsgKind::Done,
            NLMSG_ERROR => {
                if self.payload.len() < 4 {
                    return MsgKind::Error(-libc::EBADMSG);
                }
                MsgKind::Error(i32::from_ne_bytes([
                    self.payload[0],
                    self.payload[1],
                    self.payload[2],
                    self.payload[3],
                ]))
            }
            t if t >> 8 == NFNL_SUBSYS_NFTABLES => MsgKind::Nft(t & 0xff),
            t => MsgKind::Other(t),
        }
    }

    /// nfgenmsg 中的协议族 / Protocol family from the nfgenmsg header.
    pub fn family(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// 跳过 nfgenmsg 后的属性 / Attributes following the nfgenmsg header.
    pub fn nft_attrs(&self) -> Attrs<'a> {
        Attrs::new(self.payload.get(NFGENMSG_LEN..).unwrap_or(&[]))
    }
}

pub struct Messages<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Messages<'a> {
    type Item = NlMsg<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLMSG_HDRLEN {
            return None;
        }
        let len = ne_u32(&self.buf[0..4]) as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            // 截断或损坏，停止解析
            self.buf = &[];
            return None;
        }
        let msg = NlMsg {
            msg_type: ne_u16(&self.buf[4..6]),
            flags: ne_u16(&self.buf[6..8]),
            seq: ne_u32(&self.buf[8..12]),
            payload: &self.buf[NLMSG_HDRLEN..len],
        };
        let advance = align4(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some(msg)
    }
}

/// 遍历一个数据报中的全部 netlink 消息 / Iterate the netlink messages of one datagram.
pub fn messages(buf: &[u8]) -> Messages<'_> {
    Messages { buf }
}

pub struct Attrs<'a> {
    buf: &'a [u8],
}

impl<'a> Attrs<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for Attrs<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = ne_u16(&self.buf[0..2]) as usize;
        if len < NLA_HDRLEN || len > self.buf.len() {
            self.buf = &[];
            return None;
        }
        let attr_type = ne_u16(&self.buf[2..4]) & NLA_TYPE_MASK;
        let payload = &self.buf[NLA_HDRLEN..len];
        let advance = align4(len).min(self.buf.len());
        self.buf = &self.buf[advance..];
        Some((attr_type, payload))
    }
}

pub fn attr_str(payload: &[u8]) -> Option<&str> {
    let end = payload
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).ok()
}

pub fn attr_be32(payload: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

pub fn attr_be64(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[inline]
fn ne_u16(b: &[u8]) -> u16 {
    u16::from_ne_bytes([b[0], b[1]])
}

#[inline]
fn ne_u32(b: &[u8]) -> u32 {
    u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
}
