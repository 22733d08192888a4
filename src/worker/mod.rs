//! 转发工作线程
//!
//! 每个 Worker 独占一个 mio Poll 和一张会话表。接收线程只能通过
//! [`WorkerRef::register`] 把新连接对放入交接队列，真正的注册由
//! Worker 线程在下一次循环中完成，因此会话状态从不跨线程共享。

mod relay;
mod session;

use crate::buffer_pool::BufferPool;
use crate::error::{ProxyError, Result};
use crate::stats::RelayStats;
use crossbeam_queue::SegQueue;
use mio::net::TcpStream;
use mio::{Events, Poll, Token, Waker};
use relay::{Readiness, Relay};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 唤醒事件使用的 Token，会话下标不会达到这个值
const WAKE_TOKEN: Token = Token(usize::MAX);

/// 每次 poll 最多取回的事件数
const EVENTS_CAPACITY: usize = 1024;

/// 交给 Worker 的一对连接
pub struct Registration {
    pub(crate) route: Arc<str>,
    pub(crate) remote: SocketAddr,
    pub(crate) inbound: TcpStream,
    pub(crate) outbound: TcpStream,
}

impl Registration {
    /// inbound 必须已连接，outbound 是已发起的非阻塞连接
    pub fn new(
        route: impl Into<Arc<str>>,
        remote: SocketAddr,
        inbound: TcpStream,
        outbound: TcpStream,
    ) -> Self {
        Self {
            route: route.into(),
            remote,
            inbound,
            outbound,
        }
    }

    /// 连接所属的端口映射名称
    pub fn route(&self) -> &str {
        &self.route
    }

    /// 远程地址
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

/// Worker 共享的运行资源
#[derive(Clone)]
pub struct WorkerContext {
    pub buffer_pool: Arc<BufferPool>,
    pub stats: RelayStats,
}

struct Shared {
    queue: SegQueue<Registration>,
    wakeup_pending: AtomicBool,
    interrupted: AtomicBool,
    waker: OnceLock<Waker>,
}

impl Shared {
    /// 关闭交接队列中所有尚未注册的连接，返回数量
    fn discard_queued(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    fn wake(&self) -> io::Result<()> {
        match self.waker.get() {
            Some(waker) => waker.wake(),
            // 线程尚未就绪，启动后会先检查队列
            None => Ok(()),
        }
    }
}

/// 可跨线程传递的 Worker 句柄
#[derive(Clone)]
pub struct WorkerRef {
    name: Arc<str>,
    shared: Arc<Shared>,
}

impl WorkerRef {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 把一对连接交给 Worker
    ///
    /// 只有把唤醒标志从 false 改为 true 的调用者才会真正唤醒 Worker，
    /// 同一轮中的其他调用只入队。Worker 已停止时连接被直接关闭。
    pub fn register(&self, registration: Registration) -> Result<()> {
        if self.shared.interrupted.load(Ordering::Acquire) {
            return Err(ProxyError::lifecycle(format!(
                "worker {} is no longer running",
                self.name
            )));
        }

        self.shared.queue.push(registration);
        fence(Ordering::SeqCst);

        // Worker 可能在上面的检查之后完成了最后一次清空
        if self.shared.interrupted.load(Ordering::SeqCst) {
            self.shared.discard_queued();
            return Err(ProxyError::lifecycle(format!(
                "worker {} stopped while registering",
                self.name
            )));
        }

        if self
            .shared
            .wakeup_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.shared.wake()?;
        }
        Ok(())
    }

    /// 请求 Worker 停止，可重复调用
    pub fn interrupt(&self) -> Result<()> {
        self.shared.interrupted.store(true, Ordering::SeqCst);
        self.shared.wake()?;
        Ok(())
    }

    /// 交接队列中尚未被处理的连接对数量
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

/// 拥有工作线程的 Worker
pub struct Worker {
    handle: WorkerRef,
    thread: Option<JoinHandle<()>>,
    ready: Option<mpsc::Receiver<io::Result<()>>>,
}

impl Worker {
    /// 启动工作线程；线程在创建好多路复用器后通过 [`Worker::wait_ready`] 报告
    pub fn spawn(name: impl Into<String>, ctx: WorkerContext) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            wakeup_pending: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            waker: OnceLock::new(),
        });

        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);
        let thread_name = name.clone();

        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(&thread_name, thread_shared, ctx, ready_tx))?;

        Ok(Self {
            handle: WorkerRef {
                name: Arc::from(name),
                shared,
            },
            thread: Some(thread),
            ready: Some(ready_rx),
        })
    }

    /// 等待工作线程就绪
    pub fn wait_ready(&mut self) -> Result<()> {
        let Some(ready) = self.ready.take() else {
            return Ok(());
        };

        match ready.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProxyError::start_failed(format!(
                "worker {} failed to create its multiplexer: {}",
                self.handle.name, e
            ))),
            Err(_) => Err(ProxyError::start_failed(format!(
                "worker {} exited before becoming ready",
                self.handle.name
            ))),
        }
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// 获取可交给接收线程的句柄
    pub fn handle(&self) -> WorkerRef {
        self.handle.clone()
    }

    pub fn interrupt(&self) -> Result<()> {
        self.handle.interrupt()
    }

    /// 等待工作线程退出
    pub fn join(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Err(ProxyError::lifecycle(format!(
                "worker {} has already been joined",
                self.handle.name
            )));
        };

        let joined = thread.join().map_err(|_| {
            ProxyError::Other(anyhow::anyhow!("worker {} panicked", self.handle.name))
        });

        let dropped = self.handle.shared.discard_queued();
        if dropped > 0 {
            warn!(
                "Worker {} closed {} connection pairs queued after it stopped",
                self.handle.name, dropped
            );
        }
        joined
    }
}

/// 工作线程主体
fn run(name: &str, shared: Arc<Shared>, ctx: WorkerContext, ready: mpsc::Sender<io::Result<()>>) {
    let mut poll = match create_poll(&shared) {
        Ok(poll) => {
            let _ = ready.send(Ok(()));
            poll
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    drop(ready);

    debug!("Worker {} started", name);

    let mut relay = Relay::new(ctx.buffer_pool, ctx.stats);
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    loop {
        if shared.interrupted.load(Ordering::Acquire) {
            break;
        }

        // 先清除标志再检查队列：清除之后入队的生产者必然会再次唤醒
        shared.wakeup_pending.store(false, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        let timeout = if shared.queue.is_empty() {
            None
        } else {
            Some(Duration::ZERO)
        };

        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("Worker {} failed to poll: {}", name, e);
            break;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            relay.dispatch(poll.registry(), event.token(), Readiness::from(event));
        }

        let mut registered = 0;
        while let Some(registration) = shared.queue.pop() {
            relay.register(poll.registry(), registration);
            registered += 1;
        }
        if registered > 0 {
            debug!(
                "Worker {} registered {} connection pairs, now owns {} sockets",
                name,
                registered,
                relay.len()
            );
        }
    }

    // 停止前关闭所有连接，包括尚未注册的
    shared.interrupted.store(true, Ordering::SeqCst);
    fence(Ordering::SeqCst);
    let closed = relay.close_all(poll.registry());
    let dropped = shared.discard_queued();
    if dropped > 0 {
        warn!("Worker {} dropped {} queued connection pairs", name, dropped);
    }

    info!("Worker {} stopped, closed {} sockets", name, closed);
}

fn create_poll(shared: &Shared) -> io::Result<Poll> {
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
    // 每个 Shared 只属于一个线程，不会被设置两次
    let _ = shared.waker.set(waker);
    Ok(poll)
}
