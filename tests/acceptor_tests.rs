/// Acceptor strategy tests
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tcproxy::{Acceptor, BlockingAcceptor, ConnectionHandler, NonBlockingAcceptor};

const LISTENERS: usize = 3;
const CLIENTS_PER_LISTENER: usize = 5;

/// Records the listener index of every accepted connection
struct RecordingHandler {
    listeners: Vec<SocketAddr>,
    accepted: Mutex<Vec<usize>>,
}

impl ConnectionHandler for RecordingHandler {
    fn handle(&self, listener: SocketAddr, _accepted: mio::net::TcpStream) -> anyhow::Result<()> {
        let index = self
            .listeners
            .iter()
            .position(|addr| *addr == listener)
            .ok_or_else(|| anyhow::anyhow!("unknown listener {}", listener))?;
        self.accepted.lock().push(index);
        Ok(())
    }
}

/// Handler that always fails, to check that acceptance continues
struct FailingHandler {
    calls: Mutex<usize>,
}

impl ConnectionHandler for FailingHandler {
    fn handle(&self, _listener: SocketAddr, _accepted: mio::net::TcpStream) -> anyhow::Result<()> {
        *self.calls.lock() += 1;
        anyhow::bail!("handler refused connection")
    }
}

fn bind_listeners() -> (Vec<TcpListener>, Vec<SocketAddr>) {
    let listeners: Vec<_> = (0..LISTENERS)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let addrs = listeners.iter().map(|l| l.local_addr().unwrap()).collect();
    (listeners, addrs)
}

fn wait_for(expected: usize, count: impl Fn() -> usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while count() < expected && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Runs the same client load against an acceptor and returns accepted counts per listener
fn accepted_per_listener(
    make: impl FnOnce(Arc<dyn ConnectionHandler>) -> Box<dyn Acceptor>,
) -> BTreeMap<usize, usize> {
    let (listeners, addrs) = bind_listeners();
    let handler = Arc::new(RecordingHandler {
        listeners: addrs.clone(),
        accepted: Mutex::new(Vec::new()),
    });

    let shared: Arc<dyn ConnectionHandler> = handler.clone();
    let mut acceptor = make(shared);
    acceptor.start(listeners).unwrap();

    let mut clients = Vec::new();
    for addr in &addrs {
        for _ in 0..CLIENTS_PER_LISTENER {
            let mut client = TcpStream::connect(addr).unwrap();
            client.write_all(b"x").unwrap();
            clients.push(client);
        }
    }

    wait_for(clients.len(), || handler.accepted.lock().len());
    acceptor.interrupt().unwrap();
    acceptor.join().unwrap();

    let mut counts = BTreeMap::new();
    for index in handler.accepted.lock().iter() {
        *counts.entry(*index).or_insert(0) += 1;
    }
    counts
}

#[test]
fn test_strategies_accept_the_same_connections() {
    let blocking = accepted_per_listener(|h| Box::new(BlockingAcceptor::new(h)));
    let non_blocking = accepted_per_listener(|h| Box::new(NonBlockingAcceptor::new(h)));

    let expected: BTreeMap<_, _> = (0..LISTENERS).map(|i| (i, CLIENTS_PER_LISTENER)).collect();
    assert_eq!(blocking, expected);
    assert_eq!(non_blocking, expected);
}

fn handler_failure_does_not_stop_accepting(
    make: impl FnOnce(Arc<dyn ConnectionHandler>) -> Box<dyn Acceptor>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(FailingHandler {
        calls: Mutex::new(0),
    });

    let shared: Arc<dyn ConnectionHandler> = handler.clone();
    let mut acceptor = make(shared);
    acceptor.start(vec![listener]).unwrap();

    let clients: Vec<_> = (0..4).map(|_| TcpStream::connect(addr).unwrap()).collect();
    wait_for(clients.len(), || *handler.calls.lock());

    acceptor.interrupt().unwrap();
    acceptor.join().unwrap();
    assert_eq!(*handler.calls.lock(), 4);
}

#[test]
fn test_blocking_handler_failure_does_not_stop_accepting() {
    handler_failure_does_not_stop_accepting(|h| Box::new(BlockingAcceptor::new(h)));
}

#[test]
fn test_non_blocking_handler_failure_does_not_stop_accepting() {
    handler_failure_does_not_stop_accepting(|h| Box::new(NonBlockingAcceptor::new(h)));
}

#[test]
fn test_blocking_threads_are_named_per_listener() {
    struct ThreadNameHandler(Mutex<Vec<String>>);

    impl ConnectionHandler for ThreadNameHandler {
        fn handle(&self, _: SocketAddr, _: mio::net::TcpStream) -> anyhow::Result<()> {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            self.0.lock().push(name);
            Ok(())
        }
    }

    let (listeners, addrs) = bind_listeners();
    let handler = Arc::new(ThreadNameHandler(Mutex::new(Vec::new())));
    let mut acceptor = BlockingAcceptor::with_thread_prefix(handler.clone(), "proxy-accept");
    acceptor.start(listeners).unwrap();

    let _clients: Vec<_> = addrs.iter().map(|a| TcpStream::connect(a).unwrap()).collect();
    wait_for(LISTENERS, || handler.0.lock().len());
    acceptor.interrupt().unwrap();
    acceptor.join().unwrap();

    let mut names = handler.0.lock().clone();
    names.sort();
    assert_eq!(names, vec!["proxy-accept-0", "proxy-accept-1", "proxy-accept-2"]);
}
