// 配置管理模块 - 端口映射文件与进程设置

mod builder;
pub mod properties;
mod validator;

pub use builder::ProxySettingsBuilder;
pub use validator::ConfigValidator;

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::num::NonZeroUsize;
use std::path::Path;

/// 默认传输缓冲区大小
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

const LOCAL_PORT_SUFFIX: &str = ".localPort";

/// 远程端点（主机名 + 端口，按解析策略延迟解析）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEndpoint {
    host: String,
    port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 解析为 socket 地址，取第一个结果
    pub fn resolve(&self) -> Result<SocketAddr> {
        let resolve_error = || ProxyError::Resolve {
            host: self.host.clone(),
            port: self.port,
        };

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| resolve_error())?
            .next()
            .ok_or_else(resolve_error)
    }
}

impl fmt::Display for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// 本地端口与远程端点之间的映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMapping {
    title: String,
    local_addr: SocketAddr,
    remote: RemoteEndpoint,
}

impl PortMapping {
    pub fn new(title: impl Into<String>, local_addr: SocketAddr, remote: RemoteEndpoint) -> Self {
        Self {
            title: title.into(),
            local_addr,
            remote,
        }
    }

    /// 映射名称
    pub fn title(&self) -> &str {
        &self.title
    }

    /// 本地监听地址
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 远程转发目标
    pub fn remote(&self) -> &RemoteEndpoint {
        &self.remote
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' {} -> {}", self.title, self.local_addr, self.remote)
    }
}

/// 端口映射配置（按本地端口排序，端口唯一）
#[derive(Debug, Clone, Default, Serialize)]
pub struct MappingConfig {
    mappings: Vec<PortMapping>,
}

impl MappingConfig {
    /// 从文件加载映射配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::config_unavailable(path, e))?;
        Self::parse(&content)
    }

    /// 解析映射配置文本
    ///
    /// 每个映射由共享前缀的三个键声明：`<title>.localPort`、
    /// `<title>.remoteHost`、`<title>.remotePort`，可选 `<title>.localHost`。
    /// 其他键被忽略。
    pub fn parse(input: &str) -> Result<Self> {
        let props = properties::parse(input);
        let mut by_port: BTreeMap<u16, PortMapping> = BTreeMap::new();

        for (name, value) in &props {
            let Some(title) = name.strip_suffix(LOCAL_PORT_SUFFIX) else {
                continue;
            };

            let local_port = ConfigValidator::parse_port(value)?;

            let remote_host = props
                .get(&format!("{}.remoteHost", title))
                .ok_or_else(|| ProxyError::MissingKey {
                    title: title.to_string(),
                    key: "remoteHost",
                })?;
            ConfigValidator::validate_remote_host(remote_host, title)?;

            let remote_port = props
                .get(&format!("{}.remotePort", title))
                .ok_or_else(|| ProxyError::MissingKey {
                    title: title.to_string(),
                    key: "remotePort",
                })?;
            let remote_port = ConfigValidator::parse_port(remote_port)?;

            let local_ip = match props.get(&format!("{}.localHost", title)) {
                Some(host) => host.trim().parse::<IpAddr>().map_err(|_| {
                    ProxyError::invalid_config(format!(
                        "Invalid local host '{}' for mapping '{}'",
                        host, title
                    ))
                })?,
                None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            };

            let mapping = PortMapping::new(
                title,
                SocketAddr::new(local_ip, local_port),
                RemoteEndpoint::new(remote_host.trim(), remote_port),
            );

            match by_port.entry(local_port) {
                Entry::Vacant(entry) => {
                    entry.insert(mapping);
                }
                Entry::Occupied(_) => return Err(ProxyError::DuplicatePort { port: local_port }),
            }
        }

        Ok(Self {
            mappings: by_port.into_values().collect(),
        })
    }

    /// 要求至少包含一个映射
    pub fn require_non_empty(self) -> Result<Self> {
        if self.mappings.is_empty() {
            return Err(ProxyError::NoMappings);
        }
        Ok(self)
    }

    pub fn mappings(&self) -> &[PortMapping] {
        &self.mappings
    }

    pub fn into_mappings(self) -> Vec<PortMapping> {
        self.mappings
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// 接收器策略
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum AcceptorKind {
    /// 每个监听端口一个线程，阻塞 accept
    Blocking,
    /// 单线程 + 多路复用器处理所有监听端口
    #[default]
    NonBlocking,
}

impl fmt::Display for AcceptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceptorKind::Blocking => write!(f, "blocking"),
            AcceptorKind::NonBlocking => write!(f, "non-blocking"),
        }
    }
}

/// 远程地址解析策略
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ResolvePolicy {
    /// 启动时解析一次，无法解析的映射被跳过
    #[default]
    Startup,
    /// 每个新连接重新解析（适用于 DNS 切换）
    PerConnection,
}

impl fmt::Display for ResolvePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvePolicy::Startup => write!(f, "startup"),
            ResolvePolicy::PerConnection => write!(f, "per-connection"),
        }
    }
}

/// Socket 选项（未设置的选项保持系统默认值）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// SO_RCVBUF
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF
    pub send_buffer_size: Option<usize>,
    /// TCP_NODELAY
    pub no_delay: Option<bool>,
    /// SO_KEEPALIVE
    pub keep_alive: Option<bool>,
    /// SO_REUSEADDR（仅监听端口）
    pub reuse_address: Option<bool>,
}

/// 进程设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// 接收器策略
    pub acceptor: AcceptorKind,
    /// 工作线程数量
    pub workers: usize,
    /// 单次读取的传输缓冲区大小
    pub buffer_size: usize,
    /// 监听队列长度（0 表示使用系统默认值）
    pub backlog: u32,
    /// 是否复用传输缓冲区
    pub buffer_pool: bool,
    /// 远程地址解析策略
    pub resolve: ResolvePolicy,
    /// Socket 选项
    pub socket: SocketOptions,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            acceptor: AcceptorKind::default(),
            workers: default_workers(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: 0,
            buffer_pool: true,
            resolve: ResolvePolicy::default(),
            socket: SocketOptions::default(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl ProxySettings {
    /// 创建 Builder
    pub fn builder() -> ProxySettingsBuilder {
        ProxySettingsBuilder::new()
    }

    /// 从 TOML 文本解析设置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: ProxySettings = toml::from_str(content)
            .map_err(|e| ProxyError::invalid_config(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// 从 TOML 文件加载设置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::config_unavailable(path, e))?;
        Self::from_toml_str(&content)
    }

    /// 验证设置
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_settings(self)
    }
}
