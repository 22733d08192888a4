use crate::config::{AcceptorKind, ProxySettings, ProxySettingsBuilder, ResolvePolicy};
use crate::error::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tcproxy")]
#[command(author, version, about = "Multi-threaded TCP port-forwarding proxy", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// 日志级别 (trace, debug, info, warn, error)，设置 RUST_LOG 时被覆盖
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 启动代理，按 Ctrl+C 停止
    Run(RunArgs),
    /// 检查端口映射文件格式是否正确
    Check {
        /// 端口映射文件路径
        #[arg(short, long, env = "TCPROXY_CONFIG")]
        config: String,

        /// 输出格式 (text, json)
        #[arg(short, long, default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },
}

/// `run` 命令参数，命令行和环境变量覆盖设置文件中的值
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// 端口映射文件路径
    #[arg(short, long, env = "TCPROXY_CONFIG")]
    pub config: String,

    /// TOML 进程设置文件路径
    #[arg(short, long, env = "TCPROXY_SETTINGS")]
    pub settings: Option<String>,

    /// 接收器策略
    #[arg(long, value_enum, env = "TCPROXY_ACCEPTOR")]
    pub acceptor: Option<AcceptorKind>,

    /// 工作线程数量（默认为 CPU 数量）
    #[arg(short, long, env = "TCPROXY_WORKERS")]
    pub workers: Option<usize>,

    /// 传输缓冲区大小（字节）
    #[arg(long, env = "TCPROXY_BUFFER_SIZE")]
    pub buffer_size: Option<usize>,

    /// 监听队列长度（0 表示系统默认值）
    #[arg(long, env = "TCPROXY_BACKLOG")]
    pub backlog: Option<u32>,

    /// 远程地址解析策略
    #[arg(long, value_enum, env = "TCPROXY_RESOLVE")]
    pub resolve: Option<ResolvePolicy>,

    /// 不复用传输缓冲区
    #[arg(long)]
    pub no_buffer_pool: bool,

    /// SO_RCVBUF（字节）
    #[arg(long, value_name = "BYTES")]
    pub recv_buffer: Option<usize>,

    /// SO_SNDBUF（字节）
    #[arg(long, value_name = "BYTES")]
    pub send_buffer: Option<usize>,

    /// TCP_NODELAY，省略取值时为 true
    #[arg(
        long,
        env = "TCPROXY_NO_DELAY",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub no_delay: Option<bool>,

    /// SO_KEEPALIVE，省略取值时为 true
    #[arg(
        long,
        env = "TCPROXY_KEEP_ALIVE",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub keep_alive: Option<bool>,

    /// 监听端口的 SO_REUSEADDR，省略取值时为 true
    #[arg(
        long,
        env = "TCPROXY_REUSE_ADDRESS",
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub reuse_address: Option<bool>,
}

impl RunArgs {
    /// 把命令行覆盖项叠加到基础设置上
    pub fn apply(&self, base: ProxySettings) -> Result<ProxySettings> {
        let mut builder = ProxySettingsBuilder::from_settings(base);

        if let Some(kind) = self.acceptor {
            builder = builder.acceptor(kind);
        }
        if let Some(workers) = self.workers {
            builder = builder.workers(workers);
        }
        if let Some(size) = self.buffer_size {
            builder = builder.buffer_size(size);
        }
        if let Some(backlog) = self.backlog {
            builder = builder.backlog(backlog);
        }
        if let Some(policy) = self.resolve {
            builder = builder.resolve(policy);
        }
        if self.no_buffer_pool {
            builder = builder.buffer_pool(false);
        }
        if let Some(size) = self.recv_buffer {
            builder = builder.recv_buffer_size(size);
        }
        if let Some(size) = self.send_buffer {
            builder = builder.send_buffer_size(size);
        }
        if let Some(enabled) = self.no_delay {
            builder = builder.no_delay(enabled);
        }
        if let Some(enabled) = self.keep_alive {
            builder = builder.keep_alive(enabled);
        }
        if let Some(enabled) = self.reuse_address {
            builder = builder.reuse_address(enabled);
        }

        builder.build()
    }
}
