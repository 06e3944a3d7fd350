//! In-process software RDMA provider.
//!
//! `SoftFabric` implements the [`Fabric`] traits without hardware. All
//! identifiers created from one `SoftFabric` (or its clones) live on the
//! same simulated subnet:
//!
//! - connection-manager events are queued and delivered by a dedicated
//!   dispatcher thread, preserving generation order
//! - a SEND_WITH_IMM is copied from the sender's registered buffer into the
//!   oldest receive posted on the peer queue pair; with no receive posted the
//!   message waits (receiver-not-ready retry count 7 retries forever)
//! - `disconnect` moves both queue pairs to the error state and flushes every
//!   outstanding work request with `WrFlushErr`
//!
//! Every handle updates [`ResourceCounts`], and one-shot fault hooks inject
//! connect rejections, allocation failures and error completions.

mod id;
mod verbs;

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;

use crate::types::{CmEvent, QpCap, RecvWr, ResourceCounts, ResourceKind, ResourceTally, WcStatus};
use crate::{CmEventHandler, Fabric};

pub use id::SoftId;
pub use verbs::{SoftCq, SoftMr, SoftPd, SoftQp};

use verbs::CqCore;

/// First port handed out to active-side identifiers.
const EPHEMERAL_PORT_BASE: u16 = 32768;

// =============================================================================
// Fault injection
// =============================================================================

/// Pending fault injections. Each entry fires once.
#[derive(Debug, Default)]
pub(crate) struct FaultPlan {
    /// Reject this many upcoming connect requests.
    reject_connects: u32,
    /// Fail the next allocation of each listed kind.
    fail_alloc: Vec<ResourceKind>,
    /// Complete the next posted send with this status.
    fail_send: Option<WcStatus>,
    /// Refuse this many upcoming `post_recv` calls.
    fail_post_recv: u32,
}

// =============================================================================
// Simulated subnet state
// =============================================================================

/// Connection phase of an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    AddrResolved,
    RouteResolved,
    Listening,
    Connecting,
    RequestReceived,
    Established,
    Disconnected,
}

pub(crate) struct IdEntry {
    pub(crate) handler: Arc<dyn CmEventHandler<SoftFabric>>,
    pub(crate) local: Option<SocketAddrV4>,
    pub(crate) remote: Option<SocketAddrV4>,
    pub(crate) phase: Phase,
    /// The identifier is bound to a (simulated) device.
    pub(crate) has_device: bool,
    pub(crate) qpn: Option<u32>,
    /// Identifier on the other end of the connection.
    pub(crate) peer: Option<u32>,
    /// Listener this passive-side identifier was created by.
    pub(crate) parent: Option<u32>,
    pub(crate) backlog: u32,
}

/// RC queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QpState {
    Init,
    Rts,
    Error,
}

/// A message that reached a queue pair but has not been matched to a
/// posted receive yet.
pub(crate) struct Inbound {
    pub(crate) from_qpn: u32,
    pub(crate) wr_id: u64,
    pub(crate) signaled: bool,
    pub(crate) imm_data: u32,
    pub(crate) data: Vec<u8>,
}

pub(crate) struct QpEntry {
    pub(crate) pd: u32,
    pub(crate) send_cq: Arc<CqCore>,
    pub(crate) recv_cq: Arc<CqCore>,
    pub(crate) cap: QpCap,
    pub(crate) state: QpState,
    pub(crate) peer_qpn: Option<u32>,
    pub(crate) recv_queue: VecDeque<RecvWr>,
    pub(crate) inbound: VecDeque<Inbound>,
    pub(crate) outstanding_sends: u32,
}

pub(crate) struct MrEntry {
    pub(crate) pd: u32,
    pub(crate) addr: u64,
    pub(crate) len: usize,
    pub(crate) access: crate::AccessFlags,
}

#[derive(Default)]
pub(crate) struct World {
    pub(crate) ids: HashMap<u32, IdEntry>,
    pub(crate) qps: HashMap<u32, QpEntry>,
    pub(crate) mrs: HashMap<u32, MrEntry>,
    /// Local addresses bound by passive-side identifiers.
    pub(crate) bound: HashMap<SocketAddrV4, u32>,
    pub(crate) faults: FaultPlan,
    next_port: u16,
}

impl World {
    pub(crate) fn ephemeral_addr(&mut self) -> SocketAddrV4 {
        let port = EPHEMERAL_PORT_BASE.wrapping_add(self.next_port);
        self.next_port = (self.next_port + 1) % (u16::MAX - EPHEMERAL_PORT_BASE);
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Consume a pending allocation fault for `kind`.
    pub(crate) fn take_alloc_fault(&mut self, kind: ResourceKind) -> bool {
        match self.faults.fail_alloc.iter().position(|k| *k == kind) {
            Some(pos) => {
                self.faults.fail_alloc.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_reject_fault(&mut self) -> bool {
        if self.faults.reject_connects > 0 {
            self.faults.reject_connects -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn take_send_fault(&mut self) -> Option<WcStatus> {
        self.faults.fail_send.take()
    }

    pub(crate) fn take_post_recv_fault(&mut self) -> bool {
        if self.faults.fail_post_recv > 0 {
            self.faults.fail_post_recv -= 1;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Event dispatch
// =============================================================================

pub(crate) struct Dispatch {
    handler: Arc<dyn CmEventHandler<SoftFabric>>,
    event: CmEvent<SoftFabric>,
}

/// Events generated while the world lock is held; posted after unlocking so
/// that a dropped `ConnectRequest` identifier never re-enters the lock.
#[derive(Default)]
pub(crate) struct Outbox(Vec<Dispatch>);

impl Outbox {
    pub(crate) fn push(
        &mut self,
        handler: &Arc<dyn CmEventHandler<SoftFabric>>,
        event: CmEvent<SoftFabric>,
    ) {
        self.0.push(Dispatch {
            handler: handler.clone(),
            event,
        });
    }

    /// Queue `event` for the handler of identifier `id`, if it still exists.
    pub(crate) fn push_to(&mut self, world: &World, id: u32, event: CmEvent<SoftFabric>) {
        if let Some(entry) = world.ids.get(&id) {
            self.push(&entry.handler, event);
        }
    }
}

pub(crate) struct Shared {
    pub(crate) world: Mutex<World>,
    events: mpsc::Sender<Dispatch>,
    tally: ResourceTally,
    next_handle: AtomicU32,
    connect_requests: AtomicU64,
}

impl Shared {
    pub(crate) fn next_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn post(&self, outbox: Outbox) {
        for dispatch in outbox.0 {
            tracing::trace!(event = dispatch.event.name(), "queue cm event");
            // The dispatcher only exits once every sender is gone.
            let _ = self.events.send(dispatch);
        }
    }

    pub(crate) fn acquire(&self, kind: ResourceKind) {
        self.tally.acquire(kind);
    }

    pub(crate) fn release(&self, kind: ResourceKind) {
        self.tally.release(kind);
    }

    pub(crate) fn note_connect_request(&self) {
        self.connect_requests.fetch_add(1, Ordering::Relaxed);
    }
}

fn run_dispatcher(rx: mpsc::Receiver<Dispatch>) {
    while let Ok(Dispatch { handler, event }) = rx.recv() {
        tracing::trace!(event = event.name(), "deliver cm event");
        handler.on_event(event);
    }
}

// =============================================================================
// SoftFabric
// =============================================================================

/// In-process RDMA provider. Clones share the same subnet.
#[derive(Clone)]
pub struct SoftFabric {
    pub(crate) shared: Arc<Shared>,
}

impl SoftFabric {
    /// Create a new, empty subnet and start its event dispatcher.
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("soft-fabric-cm".into())
            .spawn(move || run_dispatcher(rx))?;
        Ok(Self {
            shared: Arc::new(Shared {
                world: Mutex::new(World::default()),
                events: tx,
                tally: ResourceTally::default(),
                next_handle: AtomicU32::new(1),
                connect_requests: AtomicU64::new(0),
            }),
        })
    }

    /// Reject the next `count` connect requests regardless of listeners.
    pub fn reject_next_connects(&self, count: u32) {
        self.shared.world.lock().faults.reject_connects += count;
    }

    /// Fail the next allocation of `kind` with `ENOMEM`.
    pub fn fail_next_alloc(&self, kind: ResourceKind) {
        self.shared.world.lock().faults.fail_alloc.push(kind);
    }

    /// Complete the next posted send with `status` instead of delivering it.
    /// The sending queue pair enters the error state.
    pub fn fail_next_send(&self, status: WcStatus) {
        self.shared.world.lock().faults.fail_send = Some(status);
    }

    /// Refuse the next `post_recv` with `ENOMEM`, as a full receive queue
    /// would.
    pub fn fail_next_post_recv(&self) {
        self.shared.world.lock().faults.fail_post_recv += 1;
    }

    /// Simulate hot-unplug of the device: every queue pair enters the error
    /// state and every identifier bound to the device gets `DeviceRemoval`.
    pub fn remove_device(&self) {
        let mut out = Outbox::default();
        {
            let mut world = self.shared.world.lock();
            let qpns: Vec<u32> = world.qps.keys().copied().collect();
            for qpn in qpns {
                verbs::flush_qp(&mut world, qpn);
            }
            let mut bound: Vec<u32> = world
                .ids
                .iter()
                .filter(|(_, entry)| entry.has_device)
                .map(|(handle, _)| *handle)
                .collect();
            bound.sort_unstable();
            for handle in bound {
                out.push_to(&world, handle, CmEvent::DeviceRemoval);
            }
        }
        tracing::debug!(events = out.0.len(), "device removed");
        self.shared.post(out);
    }

    /// Number of connect requests issued so far, rejected ones included.
    pub fn connect_requests(&self) -> u64 {
        self.shared.connect_requests.load(Ordering::Relaxed)
    }
}

impl Fabric for SoftFabric {
    type Id = SoftId;
    type Pd = SoftPd;
    type Mr = SoftMr;
    type Cq = SoftCq;
    type Qp = SoftQp;

    fn create_id(&self, handler: Arc<dyn CmEventHandler<Self>>) -> io::Result<SoftId> {
        let mut world = self.shared.world.lock();
        if world.take_alloc_fault(ResourceKind::Id) {
            return Err(out_of_memory());
        }
        let handle = self.shared.next_handle();
        world.ids.insert(
            handle,
            IdEntry {
                handler,
                local: None,
                remote: None,
                phase: Phase::Idle,
                has_device: false,
                qpn: None,
                peer: None,
                parent: None,
                backlog: 0,
            },
        );
        drop(world);
        Ok(SoftId::attach(self.shared.clone(), handle))
    }

    fn resources(&self) -> ResourceCounts {
        self.shared.tally.snapshot()
    }
}

pub(crate) fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

pub(crate) fn out_of_memory() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOMEM)
}
