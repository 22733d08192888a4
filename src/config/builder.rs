use super::{AcceptorKind, ProxySettings, ResolvePolicy};
use crate::error::Result;

/// ProxySettings Builder
///
/// 在基础设置（默认值或 TOML 文件）之上叠加命令行/环境变量覆盖项
#[derive(Debug, Default)]
pub struct ProxySettingsBuilder {
    base: ProxySettings,
    acceptor: Option<AcceptorKind>,
    workers: Option<usize>,
    buffer_size: Option<usize>,
    backlog: Option<u32>,
    buffer_pool: Option<bool>,
    resolve: Option<ResolvePolicy>,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    no_delay: Option<bool>,
    keep_alive: Option<bool>,
    reuse_address: Option<bool>,
}

impl ProxySettingsBuilder {
    /// 创建新的 Builder（基于默认设置）
    pub fn new() -> Self {
        Self::default()
    }

    /// 基于已有设置创建 Builder
    pub fn from_settings(base: ProxySettings) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    /// 设置接收器策略
    pub fn acceptor(mut self, kind: AcceptorKind) -> Self {
        self.acceptor = Some(kind);
        self
    }

    /// 设置工作线程数量
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// 设置传输缓冲区大小
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// 设置监听队列长度
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// 设置是否复用传输缓冲区
    pub fn buffer_pool(mut self, enabled: bool) -> Self {
        self.buffer_pool = Some(enabled);
        self
    }

    /// 设置远程地址解析策略
    pub fn resolve(mut self, policy: ResolvePolicy) -> Self {
        self.resolve = Some(policy);
        self
    }

    /// 设置 SO_RCVBUF
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// 设置 SO_SNDBUF
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// 设置 TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// 设置 SO_KEEPALIVE
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = Some(enabled);
        self
    }

    /// 设置 SO_REUSEADDR
    pub fn reuse_address(mut self, enabled: bool) -> Self {
        self.reuse_address = Some(enabled);
        self
    }

    /// 构建并验证设置
    pub fn build(self) -> Result<ProxySettings> {
        let mut settings = self.base;

        if let Some(kind) = self.acceptor {
            settings.acceptor = kind;
        }
        if let Some(workers) = self.workers {
            settings.workers = workers;
        }
        if let Some(size) = self.buffer_size {
            settings.buffer_size = size;
        }
        if let Some(backlog) = self.backlog {
            settings.backlog = backlog;
        }
        if let Some(enabled) = self.buffer_pool {
            settings.buffer_pool = enabled;
        }
        if let Some(policy) = self.resolve {
            settings.resolve = policy;
        }
        if self.recv_buffer_size.is_some() {
            settings.socket.recv_buffer_size = self.recv_buffer_size;
        }
        if self.send_buffer_size.is_some() {
            settings.socket.send_buffer_size = self.send_buffer_size;
        }
        if self.no_delay.is_some() {
            settings.socket.no_delay = self.no_delay;
        }
        if self.keep_alive.is_some() {
            settings.socket.keep_alive = self.keep_alive;
        }
        if self.reuse_address.is_some() {
            settings.socket.reuse_address = self.reuse_address;
        }

        settings.validate()?;
        Ok(settings)
    }
}
