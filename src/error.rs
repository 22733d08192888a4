/// 自定义错误类型
///
/// 使用 thiserror 定义精确的错误类型，调用者可以据此区分配置错误、
/// 单连接错误以及需要终止进程的启动错误
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// 配置文件无法定位或读取
pub const EXIT_CONFIG_UNAVAILABLE: u8 = 2;
/// 配置无效或没有任何映射
pub const EXIT_CONFIG_INVALID: u8 = 3;
/// 服务器启动失败
pub const EXIT_START_FAILED: u8 = 4;
/// 其他错误
pub const EXIT_FAILURE: u8 = 1;

/// TCP 代理的主要错误类型
#[derive(Error, Debug)]
pub enum ProxyError {
    /// 配置文件不存在或无法读取
    #[error("Configuration file {path:?} could not be read: {source}")]
    ConfigUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// 配置内容无效
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// 映射缺少必需的键
    #[error("Missing '{title}.{key}' for mapping '{title}'")]
    MissingKey { title: String, key: &'static str },

    /// 端口值不是数字或超出 0..=65535
    #[error("Invalid port value: {value}")]
    InvalidPort { value: String },

    /// 多个映射使用了同一个本地端口
    #[error("Duplicated listening port in configuration: {port}")]
    DuplicatePort { port: u16 },

    /// 配置中没有任何映射
    #[error("Configuration contains no port mappings")]
    NoMappings,

    /// 远程地址无法解析
    #[error("Failed to resolve remote address {host}:{port}")]
    Resolve { host: String, port: u16 },

    /// 监听端口绑定失败
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 连接远程地址失败
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 内部一致性被破坏（程序缺陷，而非远端故障）
    #[error("Internal consistency violation: {0}")]
    InvariantViolation(String),

    /// 生命周期误用（重复启动、未启动就停止等）
    #[error("Illegal lifecycle transition: {0}")]
    Lifecycle(String),

    /// 服务器启动失败
    #[error("Server failed to start: {0}")]
    StartFailed(String),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// 创建配置不可读错误
    pub fn config_unavailable(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ConfigUnavailable {
            path: path.into(),
            source,
        }
    }

    /// 创建配置错误
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// 创建无效端口错误
    pub fn invalid_port(value: impl Into<String>) -> Self {
        Self::InvalidPort {
            value: value.into(),
        }
    }

    /// 创建连接失败错误
    pub fn connect_failed(addr: SocketAddr, source: io::Error) -> Self {
        Self::Connect { addr, source }
    }

    /// 创建内部一致性错误
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// 创建生命周期误用错误
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    /// 创建启动失败错误
    pub fn start_failed(msg: impl Into<String>) -> Self {
        Self::StartFailed(msg.into())
    }

    /// 检查是否为配置错误（不包括无法读取配置文件）
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_)
                | Self::MissingKey { .. }
                | Self::InvalidPort { .. }
                | Self::DuplicatePort { .. }
                | Self::NoMappings
        )
    }

    /// 检查是否为内部一致性错误
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }

    /// 检查是否为生命周期误用
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }

    /// 进程退出码
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ConfigUnavailable { .. } => EXIT_CONFIG_UNAVAILABLE,
            e if e.is_config_error() => EXIT_CONFIG_INVALID,
            Self::StartFailed(_) | Self::Bind { .. } | Self::Lifecycle(_) => EXIT_START_FAILED,
            _ => EXIT_FAILURE,
        }
    }
}

/// 在 anyhow 错误链中查找 ProxyError 并转换为退出码
pub fn exit_code_of(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ProxyError>())
        .map(ProxyError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}
