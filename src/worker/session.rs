//! 会话表与关注事件状态机
//!
//! 每个 socket 对应一个 Session，两个 Session 总是成对创建、互相链接。
//! 链接是对端在 slab 中的下标，关闭一侧时两个下标同时失效。

use crate::io_util::Chunk;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Session 在连接对中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// 客户端接入的连接
    Inbound,
    /// 连接远程地址的出站连接
    Outbound,
}

/// Socket 所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// 非阻塞连接尚未完成
    Connecting,
    /// 已连接
    Open,
}

/// 根据 socket 状态计算应关注的事件
///
/// - 连接中：只关注连接完成（mio 中表现为可写）
/// - 已连接：对端没有待写数据时可读；自己有待写数据时可写
///
/// 返回 None 表示当前不关注任何事件。
pub(crate) fn desired_interest(
    phase: Phase,
    own_pending: bool,
    peer_pending: bool,
) -> Option<Interest> {
    match phase {
        Phase::Connecting => Some(Interest::WRITABLE),
        Phase::Open => match (!peer_pending, own_pending) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        },
    }
}

pub(crate) struct Session {
    pub(crate) stream: TcpStream,
    pub(crate) peer: usize,
    pub(crate) role: Role,
    pub(crate) phase: Phase,
    /// 等待写入本 socket 的数据块（最多一个）
    pub(crate) pending: Option<Chunk>,
    pub(crate) route: Arc<str>,
    pub(crate) remote: SocketAddr,
    registered: Option<Interest>,
}

impl Session {
    fn new(stream: TcpStream, role: Role, phase: Phase, route: Arc<str>, remote: SocketAddr) -> Self {
        Self {
            stream,
            peer: usize::MAX,
            role,
            phase,
            pending: None,
            route,
            remote,
            registered: None,
        }
    }

    /// 当前是否在多路复用器上关注可读事件
    pub(crate) fn watches_read(&self) -> bool {
        self.registered.is_some_and(|i| i.is_readable())
    }

    /// 当前注册的关注事件
    #[cfg(test)]
    pub(crate) fn registered(&self) -> Option<Interest> {
        self.registered
    }

    /// 把多路复用器上的注册状态调整为 desired
    fn apply_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        desired: Option<Interest>,
    ) -> io::Result<()> {
        match (self.registered, desired) {
            (current, wanted) if current == wanted => return Ok(()),
            (None, Some(interest)) => registry.register(&mut self.stream, token, interest)?,
            (Some(_), Some(interest)) => registry.reregister(&mut self.stream, token, interest)?,
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        self.registered = desired;
        Ok(())
    }

    /// 从多路复用器注销（忽略错误）
    fn detach(&mut self, registry: &Registry) {
        if self.registered.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
    }
}

/// 单个 Worker 私有的会话表
pub(crate) struct SessionTable {
    slab: Slab<Session>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self { slab: Slab::new() }
    }

    /// 插入一对互相链接的 Session，返回 (inbound, outbound) 下标
    pub(crate) fn insert_pair(
        &mut self,
        inbound: TcpStream,
        outbound: TcpStream,
        route: Arc<str>,
        remote: SocketAddr,
    ) -> (usize, usize) {
        let inbound_key = self.slab.insert(Session::new(
            inbound,
            Role::Inbound,
            Phase::Open,
            Arc::clone(&route),
            remote,
        ));
        let outbound_key = self.slab.insert(Session::new(
            outbound,
            Role::Outbound,
            Phase::Connecting,
            route,
            remote,
        ));

        self.slab[inbound_key].peer = outbound_key;
        self.slab[outbound_key].peer = inbound_key;

        (inbound_key, outbound_key)
    }

    pub(crate) fn get(&self, key: usize) -> Option<&Session> {
        self.slab.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> Option<&mut Session> {
        self.slab.get_mut(key)
    }

    /// 取两个不同下标的可变引用
    pub(crate) fn pair_mut(&mut self, a: usize, b: usize) -> Option<(&mut Session, &mut Session)> {
        self.slab.get2_mut(a, b)
    }

    pub(crate) fn len(&self) -> usize {
        self.slab.len()
    }

    /// 按当前状态同步某个 socket 的关注事件
    pub(crate) fn sync_interest(&mut self, registry: &Registry, key: usize) -> io::Result<()> {
        let Some(session) = self.slab.get(key) else {
            return Ok(());
        };
        let peer_pending = self
            .slab
            .get(session.peer)
            .is_some_and(|peer| peer.pending.is_some());

        let session = &mut self.slab[key];
        let desired = desired_interest(session.phase, session.pending.is_some(), peer_pending);
        session.apply_interest(registry, Token(key), desired)
    }

    /// 移除 key 及其对端，返回被移除的 Session（最多两个）
    pub(crate) fn remove_pair(&mut self, registry: &Registry, key: usize) -> Vec<Session> {
        let mut removed = Vec::with_capacity(2);

        if let Some(mut session) = self.slab.try_remove(key) {
            session.detach(registry);
            let peer = session.peer;
            removed.push(session);

            if let Some(mut peer) = self.slab.try_remove(peer) {
                peer.detach(registry);
                removed.push(peer);
            }
        }

        removed
    }

    /// 移除全部 Session
    pub(crate) fn drain(&mut self, registry: &Registry) -> Vec<Session> {
        self.slab
            .drain()
            .map(|mut session| {
                session.detach(registry);
                session
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), TcpStream::from_std(client))
    }

    #[test]
    fn test_desired_interest_transitions() {
        assert_eq!(
            desired_interest(Phase::Connecting, false, false),
            Some(Interest::WRITABLE)
        );
        assert_eq!(
            desired_interest(Phase::Connecting, true, false),
            Some(Interest::WRITABLE)
        );
        assert_eq!(
            desired_interest(Phase::Open, false, false),
            Some(Interest::READABLE)
        );
        assert_eq!(
            desired_interest(Phase::Open, true, false),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert_eq!(
            desired_interest(Phase::Open, true, true),
            Some(Interest::WRITABLE)
        );
        assert_eq!(desired_interest(Phase::Open, false, true), None);
    }

    #[test]
    fn test_insert_pair_links_both_sides() {
        let (a, b) = connected_pair();
        let mut table = SessionTable::new();
        let remote = "127.0.0.1:80".parse().unwrap();

        let (inbound, outbound) = table.insert_pair(a, b, Arc::from("test"), remote);

        assert_eq!(table.get(inbound).unwrap().peer, outbound);
        assert_eq!(table.get(outbound).unwrap().peer, inbound);
        assert_eq!(table.get(inbound).unwrap().role, Role::Inbound);
        assert_eq!(table.get(outbound).unwrap().phase, Phase::Connecting);
    }

    #[test]
    fn test_sync_interest_and_remove_pair() {
        let poll = Poll::new().unwrap();
        let (a, b) = connected_pair();
        let mut table = SessionTable::new();
        let (inbound, outbound) =
            table.insert_pair(a, b, Arc::from("test"), "127.0.0.1:80".parse().unwrap());

        table.sync_interest(poll.registry(), inbound).unwrap();
        table.sync_interest(poll.registry(), outbound).unwrap();
        assert!(table.get(inbound).unwrap().watches_read());
        assert_eq!(
            table.get(outbound).unwrap().registered(),
            Some(Interest::WRITABLE)
        );

        // 入站数据停在出站一侧时，入站不再关注任何事件
        table.get_mut(outbound).unwrap().pending = Some(Chunk::new(vec![1, 2, 3], 3));
        table.sync_interest(poll.registry(), inbound).unwrap();
        assert_eq!(table.get(inbound).unwrap().registered(), None);

        let removed = table.remove_pair(poll.registry(), outbound);
        assert_eq!(removed.len(), 2);
        assert_eq!(table.len(), 0);
        assert!(table.get(inbound).is_none());
    }
}
