//! 连接接收器
//!
//! 接收器拥有监听 socket，并把每个新连接交给 [`ConnectionHandler`]。
//! 提供两种可互换的策略：
//! - [`BlockingAcceptor`]：每个监听 socket 一个线程，阻塞 accept
//! - [`NonBlockingAcceptor`]：一个线程用 mio 同时监听所有 socket

mod blocking;
mod non_blocking;

pub use blocking::BlockingAcceptor;
pub use non_blocking::NonBlockingAcceptor;

use crate::config::AcceptorKind;
use crate::error::Result;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

/// 处理接收到的连接
///
/// 返回错误时接收器记录日志并关闭该连接，不影响后续接收。
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, listener: SocketAddr, accepted: mio::net::TcpStream) -> anyhow::Result<()>;
}

/// 接收器生命周期
///
/// `start` 只能调用一次；`interrupt` 和 `join` 必须在 `start` 之后调用。
/// `interrupt` 可以重复调用。
pub trait Acceptor: Send {
    fn start(&mut self, listeners: Vec<std::net::TcpListener>) -> Result<()>;

    fn interrupt(&self) -> Result<()>;

    fn join(&mut self) -> Result<()>;
}

/// 按策略创建接收器
pub fn create(kind: AcceptorKind, handler: Arc<dyn ConnectionHandler>) -> Box<dyn Acceptor> {
    match kind {
        AcceptorKind::Blocking => Box::new(BlockingAcceptor::new(handler)),
        AcceptorKind::NonBlocking => Box::new(NonBlockingAcceptor::new(handler)),
    }
}

/// 调用处理器，失败时记录日志；连接随 `accepted` 一起被丢弃关闭
fn hand_off(handler: &dyn ConnectionHandler, listener: SocketAddr, accepted: mio::net::TcpStream) {
    let peer = accepted.peer_addr().ok();
    if let Err(e) = handler.handle(listener, accepted) {
        match peer {
            Some(peer) => warn!(
                "Failed to handle connection from {} on {}: {:#}",
                peer, listener, e
            ),
            None => warn!("Failed to handle connection on {}: {:#}", listener, e),
        }
    }
}

/// 本机可以连接到的监听地址（通配地址换成回环地址）
fn loopback_of(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}
