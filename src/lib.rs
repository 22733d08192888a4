/// tcproxy 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod acceptor;
pub mod buffer_pool;
pub mod channel;
pub mod cli;
pub mod config;
pub mod error;
pub mod io_util;
pub mod server;
pub mod stats;
pub mod worker;

// 重新导出常用类型
pub use acceptor::{Acceptor, BlockingAcceptor, ConnectionHandler, NonBlockingAcceptor};
pub use config::{
    AcceptorKind, MappingConfig, PortMapping, ProxySettings, RemoteEndpoint, ResolvePolicy,
    SocketOptions,
};
pub use error::{ProxyError, Result};
pub use server::ProxyServer;
pub use stats::{RelayStats, StatsSnapshot};
pub use worker::{Registration, Worker, WorkerContext, WorkerRef};
