//! Socket 工厂
//!
//! 按配置的选项创建监听 socket 和出站 socket。不被平台支持或取值无效的
//! 选项只记录警告并跳过，其他错误向上传播。

use crate::config::SocketOptions;
use crate::error::{ProxyError, Result};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use tracing::{debug, warn};

/// 系统默认监听队列长度（backlog 为 0 时使用）
const DEFAULT_BACKLOG: i32 = 1024;

/// 监听 socket 工厂
#[derive(Debug, Clone, Default)]
pub struct ListenerFactory {
    options: SocketOptions,
    backlog: u32,
}

impl ListenerFactory {
    pub fn new(options: SocketOptions, backlog: u32) -> Self {
        Self { options, backlog }
    }

    /// 创建、配置并绑定监听 socket（阻塞模式）
    pub fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
        let bind_error = |source: io::Error| ProxyError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_error)?;

        if let Some(reuse) = self.options.reuse_address {
            skip_unsupported("SO_REUSEADDR", socket.set_reuse_address(reuse)).map_err(bind_error)?;
        }
        // 接收缓冲区需要在 listen 之前设置，accept 出来的连接会继承
        if let Some(size) = self.options.recv_buffer_size {
            skip_unsupported("SO_RCVBUF", socket.set_recv_buffer_size(size)).map_err(bind_error)?;
        }

        socket.bind(&addr.into()).map_err(bind_error)?;
        socket.listen(self.backlog()).map_err(bind_error)?;

        debug!("Bound listening socket {} (backlog: {})", addr, self.backlog());
        Ok(socket.into())
    }

    fn backlog(&self) -> i32 {
        match self.backlog {
            0 => DEFAULT_BACKLOG,
            n => i32::try_from(n).unwrap_or(i32::MAX),
        }
    }
}

/// 连接 socket 工厂
#[derive(Debug, Clone, Default)]
pub struct StreamFactory {
    options: SocketOptions,
}

impl StreamFactory {
    pub fn new(options: SocketOptions) -> Self {
        Self { options }
    }

    /// 发起非阻塞连接，返回处于连接中状态的 socket
    ///
    /// 缓冲区等选项必须在发出 SYN 之前设置，连接建立后再缩小接收缓冲区
    /// 会与已协商的窗口缩放冲突。
    pub fn connect(&self, addr: SocketAddr) -> Result<mio::net::TcpStream> {
        let connect_error = |source: io::Error| ProxyError::connect_failed(addr, source);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(connect_error)?;
        self.apply_buffers(&socket)?;
        socket.set_nonblocking(true).map_err(connect_error)?;

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if is_connect_in_progress(&e) => {}
            Err(e) => return Err(connect_error(e)),
        }

        let stream = mio::net::TcpStream::from_std(socket.into());
        if let Some(no_delay) = self.options.no_delay {
            skip_unsupported("TCP_NODELAY", stream.set_nodelay(no_delay))?;
        }
        Ok(stream)
    }

    /// 对接收到的连接应用 socket 选项
    ///
    /// 接收缓冲区已经在监听 socket 上设置并被继承，这里不再修改。
    pub fn configure(&self, stream: &mio::net::TcpStream) -> Result<()> {
        let sock = SockRef::from(stream);

        if let Some(size) = self.options.send_buffer_size {
            skip_unsupported("SO_SNDBUF", sock.set_send_buffer_size(size))?;
        }
        if let Some(keep_alive) = self.options.keep_alive {
            skip_unsupported("SO_KEEPALIVE", sock.set_keepalive(keep_alive))?;
        }
        if let Some(no_delay) = self.options.no_delay {
            skip_unsupported("TCP_NODELAY", stream.set_nodelay(no_delay))?;
        }

        Ok(())
    }

    fn apply_buffers(&self, socket: &Socket) -> Result<()> {
        if let Some(size) = self.options.recv_buffer_size {
            skip_unsupported("SO_RCVBUF", socket.set_recv_buffer_size(size))?;
        }
        if let Some(size) = self.options.send_buffer_size {
            skip_unsupported("SO_SNDBUF", socket.set_send_buffer_size(size))?;
        }
        if let Some(keep_alive) = self.options.keep_alive {
            skip_unsupported("SO_KEEPALIVE", socket.set_keepalive(keep_alive))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn is_connect_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn is_connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// 不支持或无效的选项记录警告并跳过
fn skip_unsupported(option: &str, result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if is_unsupported(&e) => {
            warn!("Socket option {} is not applicable, skipping: {}", option, e);
            Ok(())
        }
        other => other,
    }
}

fn is_unsupported(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Unsupported | io::ErrorKind::InvalidInput
    )
}
