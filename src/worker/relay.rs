//! 事件分发与背压
//!
//! 每个方向最多只有一个数据块在途：A 读到的数据写不完时，剩余部分挂在
//! B 的 pending 上，A 停止读取，B 关注可写；B 写完后恢复 A 的读取。

use super::session::{Phase, Role, SessionTable};
use super::Registration;
use crate::buffer_pool::BufferPool;
use crate::error::{ProxyError, Result};
use crate::io_util::{write_chunk, Chunk};
use crate::stats::RelayStats;
use mio::event::Event;
use mio::{Registry, Token};
use std::io::{self, Read};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 一次唤醒中某个 socket 上就绪的事件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }
}

/// Worker 线程私有的转发状态
pub(crate) struct Relay {
    sessions: SessionTable,
    pool: Arc<BufferPool>,
    stats: RelayStats,
}

impl Relay {
    pub(crate) fn new(pool: Arc<BufferPool>, stats: RelayStats) -> Self {
        Self {
            sessions: SessionTable::new(),
            pool,
            stats,
        }
    }

    /// 当前持有的 socket 数量
    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    /// 接管一对新连接并注册到多路复用器
    pub(crate) fn register(&mut self, registry: &Registry, registration: Registration) {
        let Registration {
            route,
            remote,
            inbound,
            outbound,
        } = registration;

        let (inbound_key, outbound_key) =
            self.sessions.insert_pair(inbound, outbound, route, remote);
        self.stats.pair_registered();

        let result = self
            .sessions
            .sync_interest(registry, inbound_key)
            .and_then(|_| self.sessions.sync_interest(registry, outbound_key));

        if let Err(e) = result {
            warn!("Failed to register connection pair for {}: {}", remote, e);
            self.close_pair(registry, inbound_key);
        }
    }

    /// 处理一个 socket 的就绪事件；任何错误只关闭这一对连接
    pub(crate) fn dispatch(&mut self, registry: &Registry, token: Token, readiness: Readiness) {
        if let Err(e) = self.dispatch_inner(registry, token.0, readiness) {
            let route = self
                .sessions
                .get(token.0)
                .map(|s| s.route.to_string())
                .unwrap_or_default();

            match e {
                ProxyError::InvariantViolation(_) => {
                    self.stats.invariant_violated();
                    error!("Closing connection pair of '{}': {}", route, e);
                }
                ProxyError::Connect { .. } => {
                    self.stats.connect_failed();
                    warn!("Closing originating connection of '{}': {}", route, e);
                }
                e => warn!("Closing connection pair of '{}': {}", route, e),
            }

            self.close_pair(registry, token.0);
        }
    }

    fn dispatch_inner(&mut self, registry: &Registry, key: usize, readiness: Readiness) -> Result<()> {
        let Some(session) = self.sessions.get(key) else {
            // 同一批事件中对端已被关闭
            return Ok(());
        };

        // 1. 连接完成
        if session.phase == Phase::Connecting {
            if !(readiness.writable || readiness.error || readiness.read_closed) {
                return Ok(());
            }
            if !self.finish_connect(registry, key)? {
                return Ok(());
            }
        } else if readiness.error {
            if let Some(e) = session.stream.take_error()? {
                return Err(e.into());
            }
        }

        // 2. 可读
        let watches_read = self.sessions.get(key).is_some_and(|s| s.watches_read());
        if watches_read && (readiness.readable || readiness.read_closed) {
            self.on_readable(registry, key)?;
        }

        // 3. 可写
        let has_pending = self
            .sessions
            .get(key)
            .is_some_and(|s| s.phase == Phase::Open && s.pending.is_some());
        if has_pending && readiness.writable {
            self.on_writable(registry, key)?;
        }

        Ok(())
    }

    /// 完成非阻塞连接，返回是否已连接
    fn finish_connect(&mut self, registry: &Registry, key: usize) -> Result<bool> {
        let Some(session) = self.sessions.get_mut(key) else {
            return Ok(false);
        };
        let remote = session.remote;

        if let Some(e) = session
            .stream
            .take_error()
            .map_err(|e| ProxyError::connect_failed(remote, e))?
        {
            return Err(ProxyError::connect_failed(remote, e));
        }

        match session.stream.peer_addr() {
            Ok(addr) => {
                session.phase = Phase::Open;
                debug!("Established connection with remote {} for '{}'", addr, session.route);
                self.sessions.sync_interest(registry, key)?;
                Ok(true)
            }
            // 虚假唤醒，继续等待
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(ProxyError::connect_failed(remote, e)),
        }
    }

    /// 读取数据并尽量直接写给对端；对端写不完时挂起并暂停读取
    fn on_readable(&mut self, registry: &Registry, key: usize) -> Result<()> {
        let Some((peer_key, route)) = self
            .sessions
            .get(key)
            .map(|s| (s.peer, Arc::clone(&s.route)))
        else {
            return Ok(());
        };

        if self
            .sessions
            .get(peer_key)
            .is_some_and(|p| p.pending.is_some())
        {
            return Err(ProxyError::invariant(format!(
                "readable event on '{}' while its peer still holds a pending buffer",
                route
            )));
        }

        loop {
            let Some((session, peer)) = self.sessions.pair_mut(key, peer_key) else {
                return Ok(());
            };

            let mut buf = self.pool.acquire();
            let read = match session.stream.read(&mut buf) {
                Ok(0) => {
                    self.pool.release(buf);
                    debug!("Connection closed by {:?} side of '{}'", session.role, route);
                    self.close_pair(registry, key);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pool.release(buf);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.pool.release(buf);
                    continue;
                }
                Err(e) => {
                    self.pool.release(buf);
                    return Err(e.into());
                }
            };

            match session.role {
                Role::Inbound => self.stats.add_bytes_upstream(read as u64),
                Role::Outbound => self.stats.add_bytes_downstream(read as u64),
            }

            let mut chunk = Chunk::new(buf, read);
            if peer.phase == Phase::Open {
                if let Err(e) = write_chunk(&mut peer.stream, &mut chunk) {
                    self.pool.release(chunk.into_inner());
                    return Err(e.into());
                }
            }

            if chunk.is_empty() {
                self.pool.release(chunk.into_inner());
                continue;
            }

            // 对端暂时无法接收：挂起剩余数据，暂停本端读取
            peer.pending = Some(chunk);
            self.stats.buffer_parked();
            self.sessions.sync_interest(registry, key)?;
            self.sessions.sync_interest(registry, peer_key)?;
            return Ok(());
        }
    }

    /// 写出挂起的数据；写完后恢复对端读取
    fn on_writable(&mut self, registry: &Registry, key: usize) -> Result<()> {
        let Some(session) = self.sessions.get_mut(key) else {
            return Ok(());
        };
        let Some(chunk) = session.pending.as_mut() else {
            return Ok(());
        };

        write_chunk(&mut session.stream, chunk)?;
        if !chunk.is_empty() {
            return Ok(());
        }

        if let Some(chunk) = session.pending.take() {
            self.pool.release(chunk.into_inner());
            self.stats.buffer_released();
        }
        let peer_key = session.peer;

        self.sessions.sync_interest(registry, key)?;
        self.sessions.sync_interest(registry, peer_key)?;
        Ok(())
    }

    /// 关闭一对连接并丢弃两个 Session
    pub(crate) fn close_pair(&mut self, registry: &Registry, key: usize) {
        let removed = self.sessions.remove_pair(registry, key);
        if removed.is_empty() {
            return;
        }

        for session in removed {
            if let Some(chunk) = session.pending {
                self.pool.release(chunk.into_inner());
                self.stats.buffer_released();
            }
        }
        self.stats.pair_closed();
    }

    /// 关闭全部连接，返回关闭的 socket 数量
    pub(crate) fn close_all(&mut self, registry: &Registry) -> usize {
        let removed = self.sessions.drain(registry);
        let count = removed.len();

        for session in removed {
            if let Some(chunk) = session.pending {
                self.pool.release(chunk.into_inner());
                self.stats.buffer_released();
            }
            if session.role == Role::Inbound {
                self.stats.pair_closed();
            }
        }

        count
    }

    #[cfg(test)]
    pub(crate) fn sessions_mut(&mut self) -> &mut SessionTable {
        &mut self.sessions
    }
}
