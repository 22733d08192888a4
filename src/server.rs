//! 代理编排器
//!
//! 负责绑定监听端口、启动 Worker 和接收器，把接收到的连接分配给
//! 随机选中的 Worker，并管理整体的启动与关闭。

use crate::acceptor::{self, Acceptor, ConnectionHandler};
use crate::buffer_pool::BufferPool;
use crate::channel::{ListenerFactory, StreamFactory};
use crate::config::{PortMapping, ProxySettings, ResolvePolicy};
use crate::error::{ProxyError, Result};
use crate::stats::{RelayStats, StatsSnapshot};
use crate::worker::{Registration, Worker, WorkerContext, WorkerRef};
use anyhow::Context;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 监听 socket 对应的转发目标
#[derive(Debug, Clone)]
struct Route {
    title: Arc<str>,
    mapping: PortMapping,
    /// 启动时解析的远程地址
    resolved: Option<SocketAddr>,
}

impl Route {
    /// 按策略得到本次连接的远程地址
    fn target(&self, policy: ResolvePolicy) -> Result<SocketAddr> {
        match (policy, self.resolved) {
            (ResolvePolicy::Startup, Some(addr)) => Ok(addr),
            _ => self.mapping.remote().resolve(),
        }
    }
}

/// 接收器调用的连接处理器：发起出站连接并交给 Worker
struct ConnectionRouter {
    routes: HashMap<SocketAddr, Route>,
    workers: Vec<WorkerRef>,
    streams: StreamFactory,
    policy: ResolvePolicy,
    stats: RelayStats,
}

impl ConnectionRouter {
    fn pick_worker(&self) -> anyhow::Result<&WorkerRef> {
        if self.workers.is_empty() {
            anyhow::bail!("No worker available");
        }
        let index = rand::rng().random_range(0..self.workers.len());
        Ok(&self.workers[index])
    }
}

impl ConnectionHandler for ConnectionRouter {
    fn handle(&self, listener: SocketAddr, accepted: mio::net::TcpStream) -> anyhow::Result<()> {
        self.stats.connection_accepted();

        let route = self
            .routes
            .get(&listener)
            .with_context(|| format!("No mapping for listener {}", listener))?;

        let remote = route
            .target(self.policy)
            .with_context(|| format!("Failed to resolve remote of '{}'", route.title))?;

        self.streams
            .configure(&accepted)
            .context("Failed to configure accepted connection")?;

        let outbound = self.streams.connect(remote).map_err(|e| {
            self.stats.connect_failed();
            e
        })?;

        let worker = self.pick_worker()?;
        debug!(
            "Forwarding connection on {} to {} via {}",
            listener,
            remote,
            worker.name()
        );
        worker.register(Registration::new(
            Arc::clone(&route.title),
            remote,
            accepted,
            outbound,
        ))?;

        Ok(())
    }
}

struct Running {
    local_addrs: Vec<SocketAddr>,
    acceptor: Box<dyn Acceptor>,
    workers: Vec<Worker>,
}

impl Running {
    /// 尽力停止所有组件，单个组件失败只记录日志
    fn stop(mut self) {
        if let Err(e) = self.acceptor.interrupt() {
            warn!("Failed to interrupt acceptor: {}", e);
        }
        for worker in &self.workers {
            if let Err(e) = worker.interrupt() {
                warn!("Failed to interrupt {}: {}", worker.name(), e);
            }
        }

        if let Err(e) = self.acceptor.join() {
            warn!("Failed to join acceptor: {}", e);
        }
        join_workers(&mut self.workers);
    }
}

fn stop_workers(workers: &mut [Worker]) {
    for worker in workers.iter() {
        if let Err(e) = worker.interrupt() {
            warn!("Failed to interrupt {}: {}", worker.name(), e);
        }
    }
    join_workers(workers);
}

fn join_workers(workers: &mut [Worker]) {
    for worker in workers.iter_mut() {
        if let Err(e) = worker.join() {
            if !e.is_lifecycle() {
                error!("Failed to join {}: {}", worker.name(), e);
            }
        }
    }
}

enum Lifecycle {
    NotStarted,
    Started(Running),
    Stopped,
}

/// TCP 端口转发代理
pub struct ProxyServer {
    settings: ProxySettings,
    stats: RelayStats,
    buffer_pool: Arc<BufferPool>,
    lifecycle: Mutex<Lifecycle>,
}

impl ProxyServer {
    pub fn new(settings: ProxySettings) -> Self {
        let buffer_pool = if settings.buffer_pool {
            BufferPool::new(settings.buffer_size)
        } else {
            BufferPool::disabled(settings.buffer_size)
        };

        Self {
            settings,
            stats: RelayStats::new(),
            buffer_pool: Arc::new(buffer_pool),
            lifecycle: Mutex::new(Lifecycle::NotStarted),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// 启动代理，返回实际绑定的监听地址
    ///
    /// 单个映射绑定失败或无法解析时只跳过该映射；没有任何映射可用时启动失败。
    pub fn start(&self, mappings: &[PortMapping]) -> Result<Vec<SocketAddr>> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::NotStarted => {}
            Lifecycle::Started(_) => return Err(ProxyError::lifecycle("proxy is already started")),
            Lifecycle::Stopped => return Err(ProxyError::lifecycle("proxy has been stopped")),
        }

        self.settings.validate()?;

        let (listeners, routes) = self.bind_all(mappings);
        if listeners.is_empty() {
            return Err(ProxyError::start_failed("no port mapping could be bound"));
        }
        let local_addrs: Vec<SocketAddr> = listeners.iter().map(|(addr, _)| *addr).collect();

        let mut workers = self.spawn_workers()?;

        let router = ConnectionRouter {
            routes,
            workers: workers.iter().map(Worker::handle).collect(),
            streams: StreamFactory::new(self.settings.socket.clone()),
            policy: self.settings.resolve,
            stats: self.stats.clone(),
        };

        let mut acceptor = acceptor::create(self.settings.acceptor, Arc::new(router));
        let listeners: Vec<_> = listeners.into_iter().map(|(_, l)| l).collect();
        if let Err(e) = acceptor.start(listeners) {
            stop_workers(&mut workers);
            return Err(ProxyError::start_failed(format!(
                "failed to start acceptor: {}",
                e
            )));
        }

        info!(
            "Proxy started with {} listeners, {} workers, {} acceptor",
            local_addrs.len(),
            workers.len(),
            self.settings.acceptor
        );

        *lifecycle = Lifecycle::Started(Running {
            local_addrs: local_addrs.clone(),
            acceptor,
            workers,
        });
        Ok(local_addrs)
    }

    /// 绑定所有映射，失败的映射被跳过
    fn bind_all(
        &self,
        mappings: &[PortMapping],
    ) -> (Vec<(SocketAddr, std::net::TcpListener)>, HashMap<SocketAddr, Route>) {
        let factory = ListenerFactory::new(self.settings.socket.clone(), self.settings.backlog);
        let mut listeners = Vec::with_capacity(mappings.len());
        let mut routes = HashMap::with_capacity(mappings.len());

        for mapping in mappings {
            let resolved = match self.settings.resolve {
                ResolvePolicy::Startup => match mapping.remote().resolve() {
                    Ok(addr) => Some(addr),
                    Err(e) => {
                        warn!("Skipping mapping '{}': {}", mapping.title(), e);
                        continue;
                    }
                },
                ResolvePolicy::PerConnection => None,
            };

            let listener = match factory.bind(mapping.local_addr()) {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Skipping mapping '{}': {}", mapping.title(), e);
                    continue;
                }
            };
            let local_addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Skipping mapping '{}': {}", mapping.title(), e);
                    continue;
                }
            };

            info!("Listening on {} for {}", local_addr, mapping);
            routes.insert(
                local_addr,
                Route {
                    title: Arc::from(mapping.title()),
                    mapping: mapping.clone(),
                    resolved,
                },
            );
            listeners.push((local_addr, listener));
        }

        (listeners, routes)
    }

    /// 启动所有 Worker 并等待它们完成初始化
    fn spawn_workers(&self) -> Result<Vec<Worker>> {
        let ctx = WorkerContext {
            buffer_pool: Arc::clone(&self.buffer_pool),
            stats: self.stats.clone(),
        };

        let mut workers = Vec::with_capacity(self.settings.workers);
        for i in 0..self.settings.workers {
            match Worker::spawn(format!("worker-{}", i), ctx.clone()) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    stop_workers(&mut workers);
                    return Err(ProxyError::start_failed(format!(
                        "failed to spawn worker-{}: {}",
                        i, e
                    )));
                }
            }
        }

        if let Err(e) = workers.iter_mut().try_for_each(Worker::wait_ready) {
            stop_workers(&mut workers);
            return Err(e);
        }

        Ok(workers)
    }

    /// 关闭代理：停止接收器和所有 Worker，并关闭全部连接
    pub fn shutdown(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Started(running) => running,
            Lifecycle::NotStarted => {
                *lifecycle = Lifecycle::NotStarted;
                return Err(ProxyError::lifecycle("proxy has not been started"));
            }
            Lifecycle::Stopped => return Err(ProxyError::lifecycle("proxy is already stopped")),
        };

        info!("Shutting down proxy");
        running.stop();
        info!("Proxy stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Started(_))
    }

    /// 当前监听的地址
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        match &*self.lifecycle.lock() {
            Lifecycle::Started(running) => running.local_addrs.clone(),
            _ => Vec::new(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Lifecycle::Started(running) =
            std::mem::replace(self.lifecycle.get_mut(), Lifecycle::Stopped)
        {
            running.stop();
        }
    }
}
