//! Connection lifecycle: connect, listen, accept and release.
//!
//! A [`Connection`] is a cloneable handle. Its hardware resources are
//! acquired in the order identifier, protection domain, completion queues,
//! slot pools, queue pair, and torn down in exactly the reverse order, both
//! by [`Connection::release`] and when a setup step fails half way.

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread;

use fabric::{CmId, ConnParam, Fabric, QpCap};
use parking_lot::{Mutex, RwLock};

use crate::cm::{Backlog, CmHandler, CmSignal, ConnState, ListenerHandler};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::slot::{PoolStats, RecvPool, SendPool, SlotState};

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Process-wide connection number, used in logs.
pub(crate) fn next_conn_id() -> u64 {
    NEXT_CONN.fetch_add(1, Ordering::Relaxed)
}

/// Role of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created by `connect`.
    Client,
    /// Created by `listen`; owns its accepted children.
    Listener,
    /// Created by a connect request arriving at a listener.
    AcceptedPeer,
}

/// External stop request for a blocking accept.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every accept watching this signal to return `ShuttingDown`.
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// =============================================================================
// Hardware resources
// =============================================================================

/// The verbs resources of an established (or establishing) connection.
///
/// Fields drop in declaration order, which is the teardown order: queue
/// pair, slot pools (deregister, then free), completion queues, protection
/// domain.
pub(crate) struct Link<F: Fabric> {
    pub(crate) qp: F::Qp,
    pub(crate) send: Mutex<SendPool<F>>,
    pub(crate) recv: Mutex<RecvPool<F>>,
    pub(crate) send_cq: F::Cq,
    pub(crate) recv_cq: F::Cq,
    _pd: F::Pd,
}

impl<F: Fabric> Link<F> {
    /// Allocate every per-connection resource and pre-post all receive
    /// slots. On failure, whatever was acquired is released in reverse.
    fn open(conn: u64, id: &F::Id, config: &TransportConfig) -> Result<Self> {
        let pd = id.alloc_pd()?;
        let send_cq = id.create_cq(config.cq_depth)?;
        let recv_cq = id.create_cq(config.cq_depth)?;
        let send = SendPool::new(&pd, config.send_slots, config.buffer_len)?;
        let mut recv = RecvPool::new(&pd, config.recv_slots, config.buffer_len)?;
        let cap = QpCap {
            max_send_wr: config.send_slots as u32,
            max_recv_wr: config.recv_slots as u32,
            ..Default::default()
        };
        let qp = id.create_qp(&pd, &send_cq, &recv_cq, &cap)?;
        let posted = recv.replenish(&qp)?;
        tracing::debug!(conn, posted, "connection resources ready");
        Ok(Self {
            qp,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            send_cq,
            recv_cq,
            _pd: pd,
        })
    }
}

// =============================================================================
// Connection
// =============================================================================

pub(crate) struct Inner<F: Fabric> {
    pub(crate) conn: u64,
    role: Role,
    pub(crate) config: Arc<TransportConfig>,
    pub(crate) signal: Arc<CmSignal>,
    /// Connect attempts it took to establish this connection.
    attempts: AtomicU32,
    /// Held for reading by every send/receive; taken on release.
    pub(crate) link: RwLock<Option<Link<F>>>,
    id: RwLock<Option<F::Id>>,
    backlog: Option<Arc<Backlog<F>>>,
    /// Backlog of the listener that created this accepted peer.
    parent: Weak<Backlog<F>>,
    released: AtomicBool,
}

impl<F: Fabric> Inner<F> {
    fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut result = Ok(());

        if let Some(backlog) = &self.backlog {
            for child in backlog.close() {
                if let Err(e) = child.release() {
                    tracing::warn!(conn = self.conn, child = child.conn_id(), error = %e, "child release failed");
                    result = result.and(Err(e));
                }
            }
        }

        if let Some(parent) = self.parent.upgrade() {
            parent.forget(self.conn);
        }

        let state = self.signal.state();
        self.signal.close();

        if matches!(state, ConnState::Connected | ConnState::Error) {
            if let Some(id) = self.id.read().as_ref() {
                if let Err(e) = id.disconnect() {
                    tracing::warn!(conn = self.conn, error = %e, "disconnect failed");
                    result = result.and(Err(e.into()));
                }
            }
        }

        drop(self.link.write().take());
        drop(self.id.write().take());
        tracing::debug!(conn = self.conn, role = ?self.role, ?state, "released");
        result
    }
}

impl<F: Fabric> Drop for Inner<F> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(conn = self.conn, error = %e, "release on drop failed");
        }
    }
}

/// One reliable, connected endpoint, or a listener.
///
/// Cloning is cheap and yields another handle to the same connection.
/// Resources are released by [`Connection::release`] or when the last
/// handle is dropped.
pub struct Connection<F: Fabric> {
    pub(crate) inner: Arc<Inner<F>>,
}

impl<F: Fabric> Clone for Connection<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: Fabric> fmt::Debug for Connection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("conn", &self.inner.conn)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

impl<F: Fabric> Connection<F> {
    pub(crate) fn from_parts(
        conn: u64,
        role: Role,
        config: Arc<TransportConfig>,
        signal: Arc<CmSignal>,
        id: F::Id,
        backlog: Option<Arc<Backlog<F>>>,
        parent: Weak<Backlog<F>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                conn,
                role,
                config,
                signal,
                attempts: AtomicU32::new(0),
                link: RwLock::new(None),
                id: RwLock::new(Some(id)),
                backlog,
                parent,
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Connect to `addr`, retrying rejected attempts from scratch.
    pub(crate) fn connect(fabric: &F, config: &Arc<TransportConfig>, addr: SocketAddrV4) -> Result<Self> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match Self::connect_once(fabric, config, addr)? {
                Some(conn) => {
                    conn.inner.attempts.store(attempts, Ordering::Relaxed);
                    tracing::debug!(conn = conn.inner.conn, %addr, attempts, "connected");
                    return Ok(conn);
                }
                None if attempts < config.connect_attempts => {
                    tracing::warn!(%addr, attempts, "connect rejected, retrying");
                    thread::sleep(config.retry_delay);
                }
                None => {
                    tracing::error!(%addr, attempts, "connect rejected, giving up");
                    return Err(Error::ConnectRejected { attempts });
                }
            }
        }
    }

    /// One connect attempt. `Ok(None)` means the peer rejected it.
    fn connect_once(fabric: &F, config: &Arc<TransportConfig>, addr: SocketAddrV4) -> Result<Option<Self>> {
        let conn = next_conn_id();
        let signal = Arc::new(CmSignal::new());
        let id = fabric.create_id(Arc::new(CmHandler::new(conn, signal.clone())))?;
        let connection = Self::from_parts(
            conn,
            Role::Client,
            config.clone(),
            signal.clone(),
            id,
            None,
            Weak::new(),
        );

        {
            let id = connection.inner.id.read();
            let id = id.as_ref().ok_or(Error::Released)?;

            id.resolve_addr(addr, config.resolve_timeout)?;
            signal.wait_for(ConnState::AddrResolved, "address resolution", config.resolve_timeout)?;
            id.resolve_route(config.resolve_timeout)?;
            signal.wait_for(ConnState::RouteResolved, "route resolution", config.resolve_timeout)?;

            let link = Link::open(conn, id, config)?;
            *connection.inner.link.write() = Some(link);

            id.connect(&ConnParam::default())?;
        }

        match signal.wait("connection establishment", config.establish_timeout)? {
            ConnState::Connected => Ok(Some(connection)),
            ConnState::ConnectRejected => {
                if let Err(e) = connection.release() {
                    tracing::warn!(conn, error = %e, "release of rejected attempt failed");
                }
                Ok(None)
            }
            actual => Err(Error::UnexpectedState {
                expected: ConnState::Connected,
                actual,
            }),
        }
    }

    /// Bind `addr` and start listening. Does not block.
    pub(crate) fn listen(fabric: &F, config: &Arc<TransportConfig>, addr: SocketAddrV4) -> Result<Self> {
        let conn = next_conn_id();
        let signal = Arc::new(CmSignal::new());
        let backlog = Arc::new(Backlog::new(conn, config.clone()));
        let handler = ListenerHandler::new(conn, signal.clone(), backlog.clone());
        let id = fabric.create_id(Arc::new(handler))?;
        id.bind_addr(addr)?;
        id.listen(config.backlog)?;
        tracing::debug!(conn, %addr, backlog = config.backlog, "listening");
        Ok(Self::from_parts(
            conn,
            Role::Listener,
            config.clone(),
            signal,
            id,
            Some(backlog),
            Weak::new(),
        ))
    }

    /// Wait for a connect request and establish it.
    pub fn accept(&self) -> Result<Self> {
        self.accept_until(&StopSignal::new())
    }

    /// Like [`accept`](Self::accept), but gives up with `ShuttingDown` once
    /// `stop` is raised. The signal is checked every `accept_wake`.
    pub fn accept_until(&self, stop: &StopSignal) -> Result<Self> {
        let backlog = self.inner.backlog.as_ref().ok_or(Error::NotListener)?;
        let child = loop {
            if stop.is_stopped() {
                return Err(Error::ShuttingDown);
            }
            if self.is_released() {
                return Err(Error::Released);
            }
            if self.inner.signal.state() == ConnState::Error {
                return Err(Error::ConnectionError);
            }
            if let Some(child) = backlog.claim(self.inner.config.accept_wake) {
                break child;
            }
        };

        if let Err(e) = child.establish_passive() {
            tracing::warn!(conn = self.inner.conn, child = child.conn_id(), error = %e, "accept failed");
            if let Err(e) = child.release() {
                tracing::warn!(child = child.conn_id(), error = %e, "release of failed child");
            }
            return Err(e);
        }
        tracing::debug!(conn = self.inner.conn, child = child.conn_id(), "accepted");
        Ok(child)
    }

    /// Allocate resources for a claimed child and complete the handshake.
    fn establish_passive(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let id = inner.id.read();
            let id = id.as_ref().ok_or(Error::Released)?;
            let link = Link::open(inner.conn, id, &inner.config)?;
            *inner.link.write() = Some(link);
            id.accept(&ConnParam::default())?;
        }
        inner.signal.wait_for(
            ConnState::Connected,
            "connection establishment",
            inner.config.establish_timeout,
        )?;
        inner.attempts.store(1, Ordering::Relaxed);
        Ok(())
    }

    /// Tear the connection down. Idempotent.
    ///
    /// A listener first releases every pending and accepted child. Then:
    /// disconnect, destroy the queue pair, free the slot pools, destroy the
    /// completion queues, deallocate the protection domain, destroy the
    /// identifier.
    pub fn release(&self) -> Result<()> {
        self.inner.release()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Process-wide number identifying this connection in logs.
    pub fn conn_id(&self) -> u64 {
        self.inner.conn
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn state(&self) -> ConnState {
        self.inner.signal.state()
    }

    /// Connect attempts used to establish this connection.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    pub fn local_addr(&self) -> Option<SocketAddrV4> {
        self.inner.id.read().as_ref().and_then(|id| id.local_addr())
    }

    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.inner.id.read().as_ref().and_then(|id| id.peer_addr())
    }

    /// Children waiting for `accept` (listeners only).
    pub fn pending_children(&self) -> usize {
        self.inner.backlog.as_ref().map_or(0, |b| b.counts().0)
    }

    /// Accepted children not yet released.
    pub fn active_children(&self) -> usize {
        self.inner.backlog.as_ref().map_or(0, |b| b.counts().1)
    }

    /// Slot occupancy, or `None` before resources exist or after release.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        let link = self.inner.link.read();
        let link = link.as_ref()?;
        let send = link.send.lock();
        let recv = link.recv.lock();
        Some(PoolStats {
            send_free: send.count(SlotState::Free),
            send_posted: send.count(SlotState::Posted),
            recv_free: recv.count(SlotState::Free),
            recv_posted: recv.count(SlotState::Posted),
            recv_decoded: recv.count(SlotState::Decoded),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_signal_is_shared() {
        let stop = StopSignal::new();
        let watcher = stop.clone();
        assert!(!watcher.is_stopped());
        stop.stop();
        assert!(watcher.is_stopped());
    }

    #[test]
    fn test_conn_ids_are_unique() {
        let a = next_conn_id();
        let b = next_conn_id();
        assert_ne!(a, b);
    }
}
