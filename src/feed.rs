use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::answer::AnswerSet;
use crate::dispatcher::{Dispatcher, ServeContext};
use crate::nft::Connector;

// 单个 UDP 报文的上限，EDNS 大应答不会被截断
const RECV_BUF: usize = 65535;

/// 只接受已解析完成的应答报文；查询和坏包返回 None。
/// Accepts already-resolved responses only; queries and garbage yield None.
pub fn decode_response(packet: &[u8]) -> Option<AnswerSet> {
    let msg = Message::from_bytes(packet).ok()?;
    if msg.message_type() != MessageType::Response {
        return None;
    }
    Some(AnswerSet::from_message(&msg))
}

// 创建带 SO_REUSEPORT 的 UDP socket，多个 worker 各持一个
pub fn bind_udp(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        debug!(addr = %addr, "SO_REUSEPORT unavailable, continuing without it");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// 应答输入 worker：每个报文单独 spawn，接收循环不等待内核。
pub async fn run_udp_worker<K: Connector>(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    dispatcher: Dispatcher<K>,
    ctx: ServeContext,
) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(RECV_BUF);

    loop {
        buf.clear();
        buf.reserve(RECV_BUF);
        match socket.recv_buf_from(&mut buf).await {
            Ok((_len, peer)) => {
                let packet = buf.split().freeze();
                let Some(answers) = decode_response(&packet) else {
                    debug!(worker_id, peer = %peer, "ignored non-response packet");
                    continue;
                };
                if !answers.has_addresses() {
                    continue;
                }
                let dispatcher = dispatcher.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = dispatcher.serve_answer(&ctx, answers).await {
                        warn!(peer = %peer, error = %err, "answer dispatch failed");
                    }
                });
            }
            Err(err) => {
                // 继续接收，不退出
                debug!(worker_id, error = %err, "udp recv failed");
            }
        }
    }
}
