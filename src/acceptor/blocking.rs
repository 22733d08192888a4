use super::{hand_off, loopback_of, Acceptor, ConnectionHandler};
use crate::error::{ProxyError, Result};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 唤醒阻塞 accept 的连接超时
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

enum State {
    Idle,
    Running {
        interrupted: Arc<AtomicBool>,
        threads: Vec<(SocketAddr, JoinHandle<()>)>,
    },
    Finished,
}

/// 每个监听 socket 一个线程的阻塞接收器
pub struct BlockingAcceptor {
    handler: Arc<dyn ConnectionHandler>,
    thread_prefix: String,
    state: State,
}

impl BlockingAcceptor {
    pub fn new(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self::with_thread_prefix(handler, "acceptor")
    }

    /// 线程名为 `<prefix>-<序号>`
    pub fn with_thread_prefix(handler: Arc<dyn ConnectionHandler>, prefix: impl Into<String>) -> Self {
        Self {
            handler,
            thread_prefix: prefix.into(),
            state: State::Idle,
        }
    }
}

impl Acceptor for BlockingAcceptor {
    fn start(&mut self, listeners: Vec<TcpListener>) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(ProxyError::lifecycle("acceptor has already been started"));
        }

        let interrupted = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(listeners.len());

        for (i, listener) in listeners.into_iter().enumerate() {
            listener.set_nonblocking(false)?;
            let addr = listener.local_addr()?;
            let handler = Arc::clone(&self.handler);
            let flag = Arc::clone(&interrupted);

            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", self.thread_prefix, i))
                .spawn(move || accept_loop(listener, addr, handler, flag));

            match spawned {
                Ok(thread) => threads.push((addr, thread)),
                Err(e) => {
                    // 已启动的线程仍需停止
                    self.state = State::Running {
                        interrupted,
                        threads,
                    };
                    let _ = self.interrupt();
                    let _ = self.join();
                    return Err(e.into());
                }
            }
        }

        self.state = State::Running {
            interrupted,
            threads,
        };
        Ok(())
    }

    fn interrupt(&self) -> Result<()> {
        let State::Running {
            interrupted,
            threads,
        } = &self.state
        else {
            return match self.state {
                State::Finished => Ok(()),
                _ => Err(ProxyError::lifecycle("acceptor has not been started")),
            };
        };

        interrupted.store(true, Ordering::Release);

        // 用一个本地连接唤醒阻塞在 accept 上的线程
        for (addr, thread) in threads {
            if thread.is_finished() {
                continue;
            }
            if let Err(e) = TcpStream::connect_timeout(&loopback_of(*addr), WAKE_TIMEOUT) {
                debug!("Failed to wake acceptor on {}: {}", addr, e);
            }
        }
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Idle => {
                self.state = State::Idle;
                Err(ProxyError::lifecycle("acceptor has not been started"))
            }
            State::Finished => Ok(()),
            State::Running { threads, .. } => {
                for (addr, thread) in threads {
                    if thread.join().is_err() {
                        error!("Acceptor thread for {} panicked", addr);
                    }
                }
                Ok(())
            }
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    addr: SocketAddr,
    handler: Arc<dyn ConnectionHandler>,
    interrupted: Arc<AtomicBool>,
) {
    info!("Accepting connections on {}", addr);

    while !interrupted.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if interrupted.load(Ordering::Acquire) {
                    // 唤醒连接或停止期间到达的连接
                    break;
                }
                debug!("Accepted connection from {} on {}", peer, addr);

                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("Failed to prepare connection from {}: {}", peer, e);
                    continue;
                }
                hand_off(handler.as_ref(), addr, mio::net::TcpStream::from_std(stream));
            }
            Err(_) if interrupted.load(Ordering::Acquire) => break,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue
            }
            Err(e) => {
                error!("Stopped accepting on {}: {}", addr, e);
                break;
            }
        }
    }

    debug!("Acceptor on {} stopped", addr);
}
