//! Connection identifiers of the software provider.

use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use super::verbs::{self, SoftCq, SoftPd, SoftQp};
use super::{IdEntry, Outbox, Phase, QpEntry, QpState, Shared, SoftFabric, World};
use super::{invalid, out_of_memory};
use crate::types::{CmEvent, ConnParam, QpCap, ResourceKind};
use crate::{CmEventHandler, CmId};

/// Largest value accepted for `retry_count` / `rnr_retry_count`.
const MAX_RETRY_COUNT: u8 = 7;

/// Connection identifier on a [`SoftFabric`].
pub struct SoftId {
    shared: Arc<Shared>,
    handle: u32,
}

impl std::fmt::Debug for SoftId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftId").field("handle", &self.handle).finish()
    }
}

fn entry(world: &World, handle: u32) -> io::Result<&IdEntry> {
    world
        .ids
        .get(&handle)
        .ok_or_else(|| invalid("identifier destroyed"))
}

fn entry_mut(world: &mut World, handle: u32) -> io::Result<&mut IdEntry> {
    world
        .ids
        .get_mut(&handle)
        .ok_or_else(|| invalid("identifier destroyed"))
}

/// Tear down an established connection between `handle` and `peer`.
///
/// Both queue pairs are flushed. `notify_self` is false when the identifier
/// is being destroyed and has nobody left to tell.
fn break_link(world: &mut World, out: &mut Outbox, handle: u32, peer: Option<u32>, notify_self: bool) {
    let sides = [Some(handle), peer];
    for side in sides.into_iter().flatten() {
        let qpn = match world.ids.get_mut(&side) {
            Some(entry) => {
                entry.phase = Phase::Disconnected;
                entry.qpn
            }
            None => None,
        };
        if let Some(qpn) = qpn {
            verbs::flush_qp(world, qpn);
        }
    }
    if notify_self {
        out.push_to(world, handle, CmEvent::Disconnected);
    }
    if let Some(peer) = peer {
        out.push_to(world, peer, CmEvent::Disconnected);
    }
}

impl SoftId {
    pub(crate) fn attach(shared: Arc<Shared>, handle: u32) -> Self {
        shared.acquire(ResourceKind::Id);
        Self { shared, handle }
    }

    /// Provider-wide identifier number.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Run `f` under the world lock and post the events it produced once the
    /// lock is released.
    fn with_world<R>(&self, f: impl FnOnce(&mut World, &mut Outbox) -> io::Result<R>) -> io::Result<R> {
        let mut out = Outbox::default();
        let result = {
            let mut world = self.shared.world.lock();
            f(&mut world, &mut out)
        };
        self.shared.post(out);
        result
    }

    fn require_device(world: &World, handle: u32) -> io::Result<()> {
        if entry(world, handle)?.has_device {
            Ok(())
        } else {
            Err(invalid("identifier is not bound to a device"))
        }
    }
}

fn check_param(param: &ConnParam) -> io::Result<()> {
    if param.retry_count > MAX_RETRY_COUNT || param.rnr_retry_count > MAX_RETRY_COUNT {
        return Err(invalid("retry count out of range"));
    }
    Ok(())
}

impl CmId<SoftFabric> for SoftId {
    fn set_handler(&self, handler: Arc<dyn CmEventHandler<SoftFabric>>) {
        if let Some(entry) = self.shared.world.lock().ids.get_mut(&self.handle) {
            entry.handler = handler;
        }
    }

    fn resolve_addr(&self, dst: SocketAddrV4, _timeout: Duration) -> io::Result<()> {
        self.with_world(|world, out| {
            let local = world.ephemeral_addr();
            let entry = entry_mut(world, self.handle)?;
            if entry.phase != Phase::Idle {
                return Err(invalid("address already resolved"));
            }
            if dst.ip().is_unspecified() || dst.ip().is_broadcast() || dst.port() == 0 {
                out.push(&entry.handler, CmEvent::AddrError);
                return Ok(());
            }
            entry.local = Some(local);
            entry.remote = Some(dst);
            entry.has_device = true;
            entry.phase = Phase::AddrResolved;
            out.push(&entry.handler, CmEvent::AddrResolved);
            Ok(())
        })
    }

    fn resolve_route(&self, _timeout: Duration) -> io::Result<()> {
        self.with_world(|world, out| {
            let entry = entry_mut(world, self.handle)?;
            if entry.phase != Phase::AddrResolved {
                return Err(invalid("address not resolved"));
            }
            entry.phase = Phase::RouteResolved;
            out.push(&entry.handler, CmEvent::RouteResolved);
            Ok(())
        })
    }

    fn bind_addr(&self, addr: SocketAddrV4) -> io::Result<()> {
        self.with_world(|world, _| {
            if world.bound.contains_key(&addr) {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{addr} already bound"),
                ));
            }
            let entry = entry_mut(world, self.handle)?;
            if entry.phase != Phase::Idle || entry.local.is_some() {
                return Err(invalid("identifier already bound"));
            }
            entry.local = Some(addr);
            entry.has_device = true;
            world.bound.insert(addr, self.handle);
            Ok(())
        })
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        self.with_world(|world, _| {
            let entry = entry_mut(world, self.handle)?;
            if entry.local.is_none() {
                return Err(invalid("listen on unbound identifier"));
            }
            if entry.phase != Phase::Idle {
                return Err(invalid("identifier cannot listen in its current state"));
            }
            entry.phase = Phase::Listening;
            entry.backlog = backlog.max(1);
            Ok(())
        })
    }

    fn alloc_pd(&self) -> io::Result<SoftPd> {
        let handle = self.with_world(|world, _| {
            Self::require_device(world, self.handle)?;
            if world.take_alloc_fault(ResourceKind::Pd) {
                return Err(out_of_memory());
            }
            Ok(self.shared.next_handle())
        })?;
        Ok(SoftPd::attach(self.shared.clone(), handle))
    }

    fn create_cq(&self, depth: u32) -> io::Result<SoftCq> {
        if depth == 0 {
            return Err(invalid("completion queue depth must be non-zero"));
        }
        let handle = self.with_world(|world, _| {
            Self::require_device(world, self.handle)?;
            if world.take_alloc_fault(ResourceKind::Cq) {
                return Err(out_of_memory());
            }
            Ok(self.shared.next_handle())
        })?;
        Ok(SoftCq::attach(self.shared.clone(), handle, depth))
    }

    fn create_qp(
        &self,
        pd: &SoftPd,
        send_cq: &SoftCq,
        recv_cq: &SoftCq,
        cap: &QpCap,
    ) -> io::Result<SoftQp> {
        let qpn = self.with_world(|world, _| {
            Self::require_device(world, self.handle)?;
            if entry(world, self.handle)?.qpn.is_some() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "identifier already has a queue pair",
                ));
            }
            if world.take_alloc_fault(ResourceKind::Qp) {
                return Err(out_of_memory());
            }
            let qpn = self.shared.next_handle();
            world.qps.insert(
                qpn,
                QpEntry {
                    pd: pd.handle(),
                    send_cq: send_cq.core().clone(),
                    recv_cq: recv_cq.core().clone(),
                    cap: *cap,
                    state: QpState::Init,
                    peer_qpn: None,
                    recv_queue: Default::default(),
                    inbound: Default::default(),
                    outstanding_sends: 0,
                },
            );
            entry_mut(world, self.handle)?.qpn = Some(qpn);
            Ok(qpn)
        })?;
        Ok(SoftQp::attach(self.shared.clone(), qpn, self.handle))
    }

    fn connect(&self, param: &ConnParam) -> io::Result<()> {
        check_param(param)?;
        self.with_world(|world, out| {
            let (remote, local) = {
                let entry = entry(world, self.handle)?;
                if entry.phase != Phase::RouteResolved {
                    return Err(invalid("route not resolved"));
                }
                if entry.qpn.is_none() {
                    return Err(invalid("connect without a queue pair"));
                }
                (entry.remote, entry.local)
            };
            self.shared.note_connect_request();

            let forced_reject = world.take_reject_fault();
            let listener = remote
                .and_then(|addr| world.bound.get(&addr).copied())
                .filter(|l| {
                    world
                        .ids
                        .get(l)
                        .is_some_and(|e| e.phase == Phase::Listening)
                });
            let listener = match listener {
                Some(l) if !forced_reject => {
                    let backlog = world.ids.get(&l).map_or(1, |e| e.backlog);
                    let waiting = world
                        .ids
                        .values()
                        .filter(|e| e.parent == Some(l) && e.phase == Phase::RequestReceived)
                        .count();
                    (waiting < backlog as usize).then_some(l)
                }
                _ => None,
            };
            let Some(listener) = listener else {
                entry_mut(world, self.handle)?.phase = Phase::Disconnected;
                out.push_to(world, self.handle, CmEvent::Rejected);
                return Ok(());
            };

            let child = self.shared.next_handle();
            let handler = entry(world, listener)?.handler.clone();
            world.ids.insert(
                child,
                IdEntry {
                    handler: handler.clone(),
                    local: remote,
                    remote: local,
                    phase: Phase::RequestReceived,
                    has_device: true,
                    qpn: None,
                    peer: Some(self.handle),
                    parent: Some(listener),
                    backlog: 0,
                },
            );
            let entry = entry_mut(world, self.handle)?;
            entry.phase = Phase::Connecting;
            entry.peer = Some(child);
            out.push(
                &handler,
                CmEvent::ConnectRequest(SoftId::attach(self.shared.clone(), child)),
            );
            Ok(())
        })
    }

    fn accept(&self, param: &ConnParam) -> io::Result<()> {
        check_param(param)?;
        self.with_world(|world, out| {
            let (peer, qpn) = {
                let entry = entry(world, self.handle)?;
                if entry.phase != Phase::RequestReceived {
                    return Err(invalid("no pending connect request"));
                }
                let qpn = entry
                    .qpn
                    .ok_or_else(|| invalid("accept without a queue pair"))?;
                (entry.peer, qpn)
            };
            let peer_qpn = peer.and_then(|p| world.ids.get(&p)).and_then(|e| {
                (e.phase == Phase::Connecting && e.peer == Some(self.handle))
                    .then_some(e.qpn)
                    .flatten()
            });
            let (Some(peer), Some(peer_qpn)) = (peer, peer_qpn) else {
                entry_mut(world, self.handle)?.phase = Phase::Disconnected;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "initiator went away",
                ));
            };

            for (a, b) in [(qpn, peer_qpn), (peer_qpn, qpn)] {
                if let Some(qp) = world.qps.get_mut(&a) {
                    qp.state = QpState::Rts;
                    qp.peer_qpn = Some(b);
                }
            }
            entry_mut(world, self.handle)?.phase = Phase::Established;
            entry_mut(world, peer)?.phase = Phase::Established;
            out.push_to(world, peer, CmEvent::Established);
            out.push_to(world, self.handle, CmEvent::Established);
            Ok(())
        })
    }

    fn reject(&self) -> io::Result<()> {
        self.with_world(|world, out| {
            let entry = entry_mut(world, self.handle)?;
            if entry.phase != Phase::RequestReceived {
                return Err(invalid("no pending connect request"));
            }
            entry.phase = Phase::Disconnected;
            let peer = entry.peer;
            if let Some(peer) = peer.and_then(|p| world.ids.get_mut(&p)) {
                peer.phase = Phase::Disconnected;
                out.push(&peer.handler, CmEvent::Rejected);
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> io::Result<()> {
        self.with_world(|world, out| {
            let (phase, peer) = {
                let entry = entry(world, self.handle)?;
                (entry.phase, entry.peer)
            };
            match phase {
                Phase::Established => break_link(world, out, self.handle, peer, true),
                Phase::Connecting => {
                    entry_mut(world, self.handle)?.phase = Phase::Disconnected;
                    if let Some(child) = peer.and_then(|p| world.ids.get_mut(&p)) {
                        if child.phase == Phase::RequestReceived {
                            child.phase = Phase::Disconnected;
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        })
    }

    fn local_addr(&self) -> Option<SocketAddrV4> {
        self.shared
            .world
            .lock()
            .ids
            .get(&self.handle)
            .and_then(|e| e.local)
    }

    fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.shared
            .world
            .lock()
            .ids
            .get(&self.handle)
            .and_then(|e| e.remote)
    }
}

impl Drop for SoftId {
    fn drop(&mut self) {
        let mut out = Outbox::default();
        {
            let mut world = self.shared.world.lock();
            if let Some((phase, peer, local)) = world
                .ids
                .get(&self.handle)
                .map(|e| (e.phase, e.peer, e.local))
            {
                match phase {
                    Phase::Established => break_link(&mut world, &mut out, self.handle, peer, false),
                    Phase::RequestReceived => {
                        // Destroying an unanswered request rejects it.
                        if let Some(peer) = peer.and_then(|p| world.ids.get_mut(&p)) {
                            if peer.phase == Phase::Connecting {
                                peer.phase = Phase::Disconnected;
                                out.push(&peer.handler, CmEvent::Rejected);
                            }
                        }
                    }
                    _ => {}
                }
                if let Some(local) = local {
                    if world.bound.get(&local) == Some(&self.handle) {
                        world.bound.remove(&local);
                    }
                }
                world.ids.remove(&self.handle);
            }
        }
        self.shared.post(out);
        self.shared.release(ResourceKind::Id);
    }
}
