use super::{hand_off, Acceptor, ConnectionHandler};
use crate::error::{ProxyError, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 256;

enum State {
    Idle,
    Running {
        interrupted: Arc<AtomicBool>,
        waker: Arc<Waker>,
        thread: JoinHandle<()>,
    },
    Finished,
}

/// 单线程 mio 接收器
pub struct NonBlockingAcceptor {
    handler: Arc<dyn ConnectionHandler>,
    thread_name: String,
    state: State,
}

impl NonBlockingAcceptor {
    pub fn new(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self::with_thread_name(handler, "acceptor")
    }

    pub fn with_thread_name(handler: Arc<dyn ConnectionHandler>, name: impl Into<String>) -> Self {
        Self {
            handler,
            thread_name: name.into(),
            state: State::Idle,
        }
    }
}

struct Listening {
    addr: SocketAddr,
    listener: TcpListener,
}

impl Acceptor for NonBlockingAcceptor {
    fn start(&mut self, listeners: Vec<std::net::TcpListener>) -> Result<()> {
        if !matches!(self.state, State::Idle) {
            return Err(ProxyError::lifecycle("acceptor has already been started"));
        }

        // 多路复用器在调用线程上创建，失败直接返回给调用者
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let mut listening = Vec::with_capacity(listeners.len());
        for (i, listener) in listeners.into_iter().enumerate() {
            listener.set_nonblocking(true)?;
            let addr = listener.local_addr()?;
            let mut listener = TcpListener::from_std(listener);
            poll.registry()
                .register(&mut listener, Token(i), Interest::READABLE)?;
            info!("Accepting connections on {}", addr);
            listening.push(Some(Listening { addr, listener }));
        }

        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupted);
        let handler = Arc::clone(&self.handler);

        let thread = std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || accept_loop(poll, listening, handler, flag))?;

        self.state = State::Running {
            interrupted,
            waker,
            thread,
        };
        Ok(())
    }

    fn interrupt(&self) -> Result<()> {
        match &self.state {
            State::Idle => Err(ProxyError::lifecycle("acceptor has not been started")),
            State::Finished => Ok(()),
            State::Running {
                interrupted, waker, ..
            } => {
                interrupted.store(true, Ordering::Release);
                waker.wake()?;
                Ok(())
            }
        }
    }

    fn join(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::Idle => {
                self.state = State::Idle;
                Err(ProxyError::lifecycle("acceptor has not been started"))
            }
            State::Finished => Ok(()),
            State::Running { thread, .. } => {
                if thread.join().is_err() {
                    error!("Acceptor thread panicked");
                }
                Ok(())
            }
        }
    }
}

fn accept_loop(
    mut poll: Poll,
    mut listening: Vec<Option<Listening>>,
    handler: Arc<dyn ConnectionHandler>,
    interrupted: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    while !interrupted.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("Acceptor failed to poll: {}", e);
            break;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let Some(slot) = listening.get_mut(event.token().0) else {
                continue;
            };
            let Some(entry) = slot.as_mut() else {
                continue;
            };

            if let Err(e) = drain_accepts(entry, handler.as_ref()) {
                error!("Stopped accepting on {}: {}", entry.addr, e);
                close_listener(poll.registry(), slot);
            }
        }
    }

    debug!("Acceptor stopped");
}

/// 只停止这一个监听 socket，并关闭它使后续连接被拒绝
fn close_listener(registry: &Registry, slot: &mut Option<Listening>) {
    if let Some(mut failed) = slot.take() {
        let _ = registry.deregister(&mut failed.listener);
    }
}

/// 接收所有已就绪的连接，直到 WouldBlock
fn drain_accepts(entry: &mut Listening, handler: &dyn ConnectionHandler) -> io::Result<()> {
    loop {
        match entry.listener.accept() {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {} on {}", peer, entry.addr);
                hand_off(handler, entry.addr, stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                ) =>
            {
                continue
            }
            // 文件描述符耗尽等暂时性错误不应停止监听
            Err(e) if is_transient(&e) => {
                warn!("Failed to accept on {}: {}", entry.addr, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::OutOfMemory
    ) || is_fd_exhausted(e)
}

/// 进程或系统的文件描述符耗尽
#[cfg(unix)]
fn is_fd_exhausted(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::ENFILE | libc::EMFILE))
}

#[cfg(not(unix))]
fn is_fd_exhausted(_e: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::testing::RecordingHandler;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    #[test]
    fn test_accepts_on_every_listener() {
        let handler = Arc::new(RecordingHandler::default());
        let mut acceptor = NonBlockingAcceptor::new(handler.clone());

        let listeners = vec![
            std::net::TcpListener::bind("127.0.0.1:0").unwrap(),
            std::net::TcpListener::bind("127.0.0.1:0").unwrap(),
        ];
        let addrs: Vec<_> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();
        acceptor.start(listeners).unwrap();

        let clients: Vec<_> = addrs
            .iter()
            .flat_map(|addr| (0..3).map(move |_| TcpStream::connect(addr).unwrap()))
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handler.accepted.lock().len() < clients.len() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        acceptor.interrupt().unwrap();
        acceptor.join().unwrap();

        let accepted = handler.accepted.lock();
        assert_eq!(accepted.len(), 6);
        for addr in &addrs {
            assert_eq!(accepted.iter().filter(|(l, _)| l == addr).count(), 3);
        }
    }

    #[test]
    fn test_failed_listener_is_closed() {
        let poll = Poll::new().unwrap();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();

        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, Token(0), Interest::READABLE)
            .unwrap();
        let mut slot = Some(Listening { addr, listener });

        close_listener(poll.registry(), &mut slot);
        assert!(slot.is_none());
        assert_eq!(
            TcpStream::connect(addr).unwrap_err().kind(),
            io::ErrorKind::ConnectionRefused
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
        #[cfg(unix)]
        {
            assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
            assert!(is_transient(&io::Error::from_raw_os_error(libc::ENFILE)));
            assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
        }
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn test_lifecycle_misuse() {
        let handler = Arc::new(RecordingHandler::default());
        let mut acceptor = NonBlockingAcceptor::new(handler);

        assert!(acceptor.interrupt().unwrap_err().is_lifecycle());
        assert!(acceptor.join().unwrap_err().is_lifecycle());

        acceptor.start(Vec::new()).unwrap();
        assert!(acceptor.start(Vec::new()).unwrap_err().is_lifecycle());

        acceptor.interrupt().unwrap();
        acceptor.join().unwrap();
        acceptor.interrupt().unwrap();
    }
}
