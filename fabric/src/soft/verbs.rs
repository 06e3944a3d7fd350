//! Protection domains, memory regions, completion queues and queue pairs of
//! the software provider.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{Inbound, MrEntry, QpState, Shared, SoftFabric, World};
use super::{invalid, out_of_memory};
use crate::types::{
    AccessFlags, RecvWr, ResourceKind, SendWr, Sge, WcOpcode, WcStatus, WorkCompletion,
};
use crate::{CompletionQueue, MemoryRegion, ProtectionDomain, QueuePair};

// =============================================================================
// Protection domain / memory region
// =============================================================================

/// Protection domain on a [`SoftFabric`].
pub struct SoftPd {
    shared: Arc<Shared>,
    handle: u32,
}

impl SoftPd {
    pub(crate) fn attach(shared: Arc<Shared>, handle: u32) -> Self {
        shared.acquire(ResourceKind::Pd);
        Self { shared, handle }
    }

    pub(crate) fn handle(&self) -> u32 {
        self.handle
    }
}

impl ProtectionDomain<SoftFabric> for SoftPd {
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<SoftMr> {
        if !access.is_valid() {
            return Err(invalid("REMOTE_WRITE/REMOTE_ATOMIC require LOCAL_WRITE"));
        }
        if addr.is_null() || len == 0 {
            return Err(invalid("empty memory region"));
        }
        let mut world = self.shared.world.lock();
        if world.take_alloc_fault(ResourceKind::Mr) {
            return Err(out_of_memory());
        }
        let lkey = self.shared.next_handle();
        world.mrs.insert(
            lkey,
            MrEntry {
                pd: self.handle,
                addr: addr as u64,
                len,
                access,
            },
        );
        drop(world);
        self.shared.acquire(ResourceKind::Mr);
        Ok(SoftMr {
            shared: self.shared.clone(),
            lkey,
            addr: addr as u64,
            len,
        })
    }
}

impl Drop for SoftPd {
    fn drop(&mut self) {
        self.shared.release(ResourceKind::Pd);
    }
}

/// Registered memory region on a [`SoftFabric`].
pub struct SoftMr {
    shared: Arc<Shared>,
    lkey: u32,
    addr: u64,
    len: usize,
}

impl MemoryRegion for SoftMr {
    fn lkey(&self) -> u32 {
        self.lkey
    }

    fn rkey(&self) -> u32 {
        self.lkey
    }

    fn addr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SoftMr {
    fn drop(&mut self) {
        self.shared.world.lock().mrs.remove(&self.lkey);
        self.shared.release(ResourceKind::Mr);
    }
}

/// Copy the bytes described by `sge` out of its registered region.
fn gather(mrs: &HashMap<u32, MrEntry>, pd: u32, sge: &Sge) -> Option<Vec<u8>> {
    covering_mr(mrs, pd, sge)?;
    let len = sge.length as usize;
    if len == 0 {
        return Some(Vec::new());
    }
    // SAFETY: the range lies inside a registered region, which the
    // registrant keeps valid until deregistration.
    let bytes = unsafe { std::slice::from_raw_parts(sge.addr as *const u8, len) };
    Some(bytes.to_vec())
}

/// Copy `data` into the receive buffer described by `sge`.
fn scatter(mrs: &HashMap<u32, MrEntry>, pd: u32, sge: &Sge, data: &[u8]) -> Result<(), WcStatus> {
    let mr = covering_mr(mrs, pd, sge).ok_or(WcStatus::LocProtErr)?;
    if !mr.access.contains(AccessFlags::LOCAL_WRITE) {
        return Err(WcStatus::LocProtErr);
    }
    if data.len() > sge.length as usize {
        return Err(WcStatus::LocLenErr);
    }
    if !data.is_empty() {
        // SAFETY: see `gather`; the region grants local write access.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), sge.addr as *mut u8, data.len());
        }
    }
    Ok(())
}

fn covering_mr<'a>(mrs: &'a HashMap<u32, MrEntry>, pd: u32, sge: &Sge) -> Option<&'a MrEntry> {
    let mr = mrs.get(&sge.lkey)?;
    let end = sge.addr.checked_add(sge.length as u64)?;
    (mr.pd == pd && sge.addr >= mr.addr && end <= mr.addr + mr.len as u64).then_some(mr)
}

// =============================================================================
// Completion queue
// =============================================================================

/// Completion storage shared between a [`SoftCq`] and the queue pairs
/// completing into it.
pub(crate) struct CqCore {
    handle: u32,
    depth: usize,
    entries: Mutex<VecDeque<WorkCompletion>>,
    overrun: AtomicBool,
}

impl CqCore {
    pub(crate) fn push(&self, wc: WorkCompletion) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.depth {
            if !self.overrun.swap(true, Ordering::AcqRel) {
                tracing::warn!(cq = self.handle, depth = self.depth, "completion queue overrun");
            }
            return;
        }
        entries.push_back(wc);
    }
}

/// Completion queue on a [`SoftFabric`].
pub struct SoftCq {
    shared: Arc<Shared>,
    core: Arc<CqCore>,
}

impl SoftCq {
    pub(crate) fn attach(shared: Arc<Shared>, handle: u32, depth: u32) -> Self {
        shared.acquire(ResourceKind::Cq);
        Self {
            shared,
            core: Arc::new(CqCore {
                handle,
                depth: depth as usize,
                entries: Mutex::new(VecDeque::with_capacity(depth as usize)),
                overrun: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<CqCore> {
        &self.core
    }
}

impl CompletionQueue for SoftCq {
    fn poll(&self, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        if self.core.overrun.load(Ordering::Acquire) {
            return Err(io::Error::other("completion queue overrun"));
        }
        let mut entries = self.core.entries.lock();
        let n = wc.len().min(entries.len());
        for (slot, entry) in wc.iter_mut().zip(entries.drain(..n)) {
            *slot = entry;
        }
        Ok(n)
    }
}

impl Drop for SoftCq {
    fn drop(&mut self) {
        self.shared.release(ResourceKind::Cq);
    }
}

// =============================================================================
// Queue pair
// =============================================================================

fn completion(wr_id: u64, status: WcStatus, opcode: WcOpcode, qp_num: u32) -> WorkCompletion {
    WorkCompletion {
        wr_id,
        status,
        opcode,
        byte_len: 0,
        imm_data: None,
        qp_num,
    }
}

/// Move `qpn` to the error state and flush everything it has outstanding:
/// posted receives, messages waiting for a receive, and its own sends still
/// queued at the peer.
pub(crate) fn flush_qp(world: &mut World, qpn: u32) {
    let Some(qp) = world.qps.get_mut(&qpn) else {
        return;
    };
    qp.state = QpState::Error;
    let recv_cq = qp.recv_cq.clone();
    let recvs: Vec<RecvWr> = qp.recv_queue.drain(..).collect();
    let mut stranded: Vec<Inbound> = qp.inbound.drain(..).collect();
    let peer = qp.peer_qpn;

    for recv in recvs {
        recv_cq.push(completion(recv.wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, qpn));
    }
    if let Some(peer) = peer.and_then(|p| world.qps.get_mut(&p)) {
        let (own, others): (VecDeque<Inbound>, VecDeque<Inbound>) =
            peer.inbound.drain(..).partition(|m| m.from_qpn == qpn);
        peer.inbound = others;
        stranded.extend(own);
    }
    for msg in stranded {
        if let Some(sender) = world.qps.get_mut(&msg.from_qpn) {
            sender.outstanding_sends = sender.outstanding_sends.saturating_sub(1);
            sender.send_cq.push(completion(
                msg.wr_id,
                WcStatus::WrFlushErr,
                WcOpcode::Send,
                msg.from_qpn,
            ));
        }
    }
}

/// Match waiting messages of `qpn` with its posted receives.
fn deliver(world: &mut World, qpn: u32) {
    loop {
        let Some(qp) = world.qps.get_mut(&qpn) else {
            return;
        };
        if qp.state != QpState::Rts || qp.inbound.is_empty() || qp.recv_queue.is_empty() {
            return;
        }
        let (Some(msg), Some(recv)) = (qp.inbound.pop_front(), qp.recv_queue.pop_front()) else {
            return;
        };
        let pd = qp.pd;
        let recv_cq = qp.recv_cq.clone();

        let placed = scatter(&world.mrs, pd, &recv.sge, &msg.data);
        let mut wc = completion(recv.wr_id, WcStatus::Success, WcOpcode::Recv, qpn);
        match placed {
            Ok(()) => {
                wc.byte_len = msg.data.len() as u32;
                wc.imm_data = Some(msg.imm_data);
            }
            Err(status) => wc.status = status,
        }
        recv_cq.push(wc);

        if let Some(sender) = world.qps.get_mut(&msg.from_qpn) {
            sender.outstanding_sends = sender.outstanding_sends.saturating_sub(1);
            if msg.signaled || placed.is_err() {
                let status = if placed.is_ok() {
                    WcStatus::Success
                } else {
                    WcStatus::RemInvReqErr
                };
                let mut wc = completion(msg.wr_id, status, WcOpcode::Send, msg.from_qpn);
                wc.byte_len = msg.data.len() as u32;
                sender.send_cq.push(wc);
            }
        }

        if placed.is_err() {
            flush_qp(world, qpn);
            flush_qp(world, msg.from_qpn);
            return;
        }
    }
}

/// RC queue pair on a [`SoftFabric`].
pub struct SoftQp {
    shared: Arc<Shared>,
    qpn: u32,
    id: u32,
}

impl SoftQp {
    pub(crate) fn attach(shared: Arc<Shared>, qpn: u32, id: u32) -> Self {
        shared.acquire(ResourceKind::Qp);
        Self { shared, qpn, id }
    }

    /// Fail a send locally: complete it with `status` and move the QP to the
    /// error state.
    fn fail_send(world: &mut World, qpn: u32, wr: &SendWr, status: WcStatus) {
        if let Some(qp) = world.qps.get(&qpn) {
            qp.send_cq.push(completion(wr.wr_id, status, WcOpcode::Send, qpn));
        }
        flush_qp(world, qpn);
    }
}

impl QueuePair for SoftQp {
    fn qp_num(&self) -> u32 {
        self.qpn
    }

    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        let mut world = self.shared.world.lock();
        let qp = world
            .qps
            .get(&self.qpn)
            .ok_or_else(|| invalid("queue pair destroyed"))?;
        match qp.state {
            QpState::Init => return Err(invalid("queue pair is not ready to send")),
            QpState::Error => {
                qp.send_cq
                    .push(completion(wr.wr_id, WcStatus::WrFlushErr, WcOpcode::Send, self.qpn));
                return Ok(());
            }
            QpState::Rts => {}
        }
        if qp.outstanding_sends >= qp.cap.max_send_wr {
            return Err(out_of_memory());
        }
        let pd = qp.pd;
        let peer_qpn = qp.peer_qpn;

        if let Some(status) = world.take_send_fault() {
            Self::fail_send(&mut world, self.qpn, wr, status);
            return Ok(());
        }
        let Some(data) = gather(&world.mrs, pd, &wr.sge) else {
            Self::fail_send(&mut world, self.qpn, wr, WcStatus::LocProtErr);
            return Ok(());
        };
        let Some(peer_qpn) = peer_qpn.filter(|p| world.qps.contains_key(p)) else {
            Self::fail_send(&mut world, self.qpn, wr, WcStatus::RetryExcErr);
            return Ok(());
        };

        if let Some(qp) = world.qps.get_mut(&self.qpn) {
            qp.outstanding_sends += 1;
        }
        if let Some(peer) = world.qps.get_mut(&peer_qpn) {
            peer.inbound.push_back(Inbound {
                from_qpn: self.qpn,
                wr_id: wr.wr_id,
                signaled: wr.signaled,
                imm_data: wr.imm_data,
                data,
            });
        }
        deliver(&mut world, peer_qpn);
        Ok(())
    }

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut world = self.shared.world.lock();
        let qp = world
            .qps
            .get_mut(&self.qpn)
            .ok_or_else(|| invalid("queue pair destroyed"))?;
        if qp.state == QpState::Error {
            qp.recv_cq
                .push(completion(wr.wr_id, WcStatus::WrFlushErr, WcOpcode::Recv, self.qpn));
            return Ok(());
        }
        if qp.recv_queue.len() >= qp.cap.max_recv_wr as usize {
            return Err(out_of_memory());
        }
        if world.take_post_recv_fault() {
            return Err(out_of_memory());
        }
        if let Some(qp) = world.qps.get_mut(&self.qpn) {
            qp.recv_queue.push_back(*wr);
        }
        deliver(&mut world, self.qpn);
        Ok(())
    }
}

impl Drop for SoftQp {
    fn drop(&mut self) {
        {
            let mut world = self.shared.world.lock();
            if let Some(qp) = world.qps.remove(&self.qpn) {
                // Sends of this QP parked at the peer die with it.
                if let Some(peer) = qp.peer_qpn.and_then(|p| world.qps.get_mut(&p)) {
                    peer.inbound.retain(|m| m.from_qpn != self.qpn);
                }
            }
            if let Some(id) = world.ids.get_mut(&self.id) {
                if id.qpn == Some(self.qpn) {
                    id.qpn = None;
                }
            }
        }
        self.shared.release(ResourceKind::Qp);
    }
}
