//! Connection state machine driven by connection-manager events.
//!
//! The fabric delivers CM events asynchronously on its own thread. Each
//! connection registers a [`CmHandler`] that maps the event onto a
//! [`ConnState`] and resolves the connection's [`CmSignal`]; the thread
//! driving connect/accept blocks on that signal. Listeners register a
//! [`ListenerHandler`] instead, which turns connect requests into pending
//! child connections.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fabric::{CmEvent, CmEventHandler, CmId, Fabric};
use parking_lot::{Condvar, Mutex};

use crate::config::TransportConfig;
use crate::connection::{Connection, Role};
use crate::error::{Error, Result};

/// Lifecycle state of a connection.
///
/// ```text
/// Init → AddrResolved → RouteResolved → Connected
///   └──────────┴──────────────┴─────────────┴──► Disconnected | ConnectRejected | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    AddrResolved,
    RouteResolved,
    Connected,
    Disconnected,
    ConnectRejected,
    Error,
}

// =============================================================================
// Completion signal
// =============================================================================

struct SignalState {
    state: ConnState,
    /// Notifications not yet consumed by a waiter.
    pending: u32,
    /// Released locally; every wait fails with `Released`.
    closed: bool,
}

/// Connection state plus a counting completion signal.
///
/// Every CM notification resolves the signal once; `wait` consumes one
/// resolution. ERROR is sticky and wakes all waiters.
pub(crate) struct CmSignal {
    inner: Mutex<SignalState>,
    cond: Condvar,
}

impl CmSignal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SignalState {
                state: ConnState::Init,
                pending: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Record one notification, moving to `next` if given.
    pub(crate) fn notify(&self, next: Option<ConnState>) {
        let mut s = self.inner.lock();
        if let Some(next) = next {
            if s.state != ConnState::Error {
                s.state = next;
            }
        }
        s.pending += 1;
        self.cond.notify_all();
    }

    /// Enter ERROR and wake every waiter.
    pub(crate) fn fail(&self) {
        let mut s = self.inner.lock();
        s.state = ConnState::Error;
        self.cond.notify_all();
    }

    /// Mark the connection released.
    pub(crate) fn close(&self) {
        let mut s = self.inner.lock();
        s.closed = true;
        if s.state != ConnState::Error {
            s.state = ConnState::Disconnected;
        }
        self.cond.notify_all();
    }

    /// Wait for one notification and return the state it left behind.
    pub(crate) fn wait(&self, step: &'static str, timeout: Duration) -> Result<ConnState> {
        let deadline = Instant::now() + timeout;
        let mut s = self.inner.lock();
        loop {
            if s.closed {
                return Err(Error::Released);
            }
            if s.state == ConnState::Error {
                return Err(Error::ConnectionError);
            }
            if s.pending > 0 {
                s.pending -= 1;
                return Ok(s.state);
            }
            if self.cond.wait_until(&mut s, deadline).timed_out() && s.pending == 0 {
                return Err(Error::Timeout(step));
            }
        }
    }

    /// Wait for one notification that must leave the connection in
    /// `expected`.
    pub(crate) fn wait_for(&self, expected: ConnState, step: &'static str, timeout: Duration) -> Result<()> {
        match self.wait(step, timeout)? {
            actual if actual == expected => Ok(()),
            actual => Err(Error::UnexpectedState { expected, actual }),
        }
    }
}

// =============================================================================
// Event handlers
// =============================================================================

/// Event handler of a client or accepted connection.
pub(crate) struct CmHandler {
    conn: u64,
    signal: Arc<CmSignal>,
}

impl CmHandler {
    pub(crate) fn new(conn: u64, signal: Arc<CmSignal>) -> Self {
        Self { conn, signal }
    }
}

impl<F: Fabric> CmEventHandler<F> for CmHandler {
    fn on_event(&self, event: CmEvent<F>) {
        tracing::debug!(conn = self.conn, event = event.name(), "cm event");
        let next = match event {
            CmEvent::AddrResolved => Some(ConnState::AddrResolved),
            CmEvent::RouteResolved => Some(ConnState::RouteResolved),
            CmEvent::Established => Some(ConnState::Connected),
            CmEvent::Disconnected => Some(ConnState::Disconnected),
            CmEvent::ConnectError | CmEvent::Unreachable | CmEvent::Rejected => {
                Some(ConnState::ConnectRejected)
            }
            CmEvent::AddrError | CmEvent::RouteError => {
                tracing::warn!(conn = self.conn, event = event.name(), "resolution failed");
                None
            }
            CmEvent::DeviceRemoval => {
                tracing::error!(conn = self.conn, "device removed");
                self.signal.fail();
                return;
            }
            CmEvent::ConnectRequest(id) => {
                // Only listeners take requests; dropping the id rejects it.
                tracing::warn!(conn = self.conn, "connect request on a non-listening connection");
                drop(id);
                None
            }
            CmEvent::ConnectResponse | CmEvent::TimewaitExit => None,
        };
        self.signal.notify(next);
    }
}

/// Event handler of a listening connection.
pub(crate) struct ListenerHandler<F: Fabric> {
    conn: u64,
    signal: Arc<CmSignal>,
    backlog: Arc<Backlog<F>>,
}

impl<F: Fabric> ListenerHandler<F> {
    pub(crate) fn new(conn: u64, signal: Arc<CmSignal>, backlog: Arc<Backlog<F>>) -> Self {
        Self {
            conn,
            signal,
            backlog,
        }
    }
}

impl<F: Fabric> CmEventHandler<F> for ListenerHandler<F> {
    fn on_event(&self, event: CmEvent<F>) {
        tracing::debug!(conn = self.conn, event = event.name(), "listener cm event");
        match event {
            CmEvent::ConnectRequest(id) => Backlog::admit(&self.backlog, id),
            CmEvent::DeviceRemoval => {
                tracing::error!(conn = self.conn, "device removed under listener");
                self.signal.fail();
                self.backlog.wake();
            }
            _ => self.signal.notify(None),
        }
    }
}

// =============================================================================
// Listener backlog
// =============================================================================

struct Children<F: Fabric> {
    /// Requests received but not yet claimed by `accept`.
    pending: VecDeque<Connection<F>>,
    /// Claimed by `accept`; released with the listener unless released
    /// first.
    active: Vec<Connection<F>>,
    closed: bool,
}

/// Child connections of a listener.
pub(crate) struct Backlog<F: Fabric> {
    listener: u64,
    config: Arc<TransportConfig>,
    children: Mutex<Children<F>>,
    cond: Condvar,
}

impl<F: Fabric> Backlog<F> {
    pub(crate) fn new(listener: u64, config: Arc<TransportConfig>) -> Self {
        Self {
            listener,
            config,
            children: Mutex::new(Children {
                pending: VecDeque::new(),
                active: Vec::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Turn a connect request into a pending child.
    ///
    /// The child keeps a weak link back so that releasing it drops it from
    /// this backlog.
    fn admit(self: &Arc<Self>, id: F::Id) {
        let mut children = self.children.lock();
        if children.closed {
            drop(children);
            tracing::debug!(listener = self.listener, "listener closed, rejecting request");
            drop(id);
            return;
        }
        let signal = Arc::new(CmSignal::new());
        let conn = crate::connection::next_conn_id();
        id.set_handler(Arc::new(CmHandler::new(conn, signal.clone())));
        let child = Connection::from_parts(
            conn,
            Role::AcceptedPeer,
            self.config.clone(),
            signal,
            id,
            None,
            Arc::downgrade(self),
        );
        tracing::debug!(listener = self.listener, conn, "connect request queued");
        children.pending.push_back(child);
        self.cond.notify_one();
    }

    /// Claim the oldest pending child, waiting up to `timeout`.
    pub(crate) fn claim(&self, timeout: Duration) -> Option<Connection<F>> {
        let mut children = self.children.lock();
        if children.pending.is_empty() && !children.closed {
            self.cond.wait_for(&mut children, timeout);
        }
        let child = children.pending.pop_front()?;
        children.active.push(child.clone());
        Some(child)
    }

    /// Forget a released child.
    pub(crate) fn forget(&self, conn: u64) {
        // Handles are dropped after unlocking.
        let removed: Vec<Connection<F>> = {
            let mut children = self.children.lock();
            let mut gone = Vec::new();
            if let Some(pos) = children.active.iter().position(|c| c.conn_id() == conn) {
                gone.push(children.active.swap_remove(pos));
            }
            if let Some(pos) = children.pending.iter().position(|c| c.conn_id() == conn) {
                gone.extend(children.pending.remove(pos));
            }
            gone
        };
        if !removed.is_empty() {
            tracing::trace!(listener = self.listener, conn, "child forgotten");
        }
    }

    pub(crate) fn wake(&self) {
        self.cond.notify_all();
    }

    /// Stop admitting requests and hand back every child for release.
    pub(crate) fn close(&self) -> Vec<Connection<F>> {
        let mut children = self.children.lock();
        children.closed = true;
        self.cond.notify_all();
        let mut all: Vec<Connection<F>> = children.pending.drain(..).collect();
        all.append(&mut children.active);
        all
    }

    /// (pending, active)
    pub(crate) fn counts(&self) -> (usize, usize) {
        let children = self.children.lock();
        (children.pending.len(), children.active.len())
    }
}
