//! Protection domains, memory regions, completion queues and queue pairs.

use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use rdma_sys::{
    ibv_access_flags, ibv_alloc_pd, ibv_context, ibv_cq, ibv_create_cq, ibv_dealloc_pd,
    ibv_dereg_mr, ibv_destroy_cq, ibv_mr, ibv_pd, ibv_poll_cq, ibv_post_recv, ibv_post_send,
    ibv_qp, ibv_recv_wr, ibv_reg_mr, ibv_send_flags, ibv_send_wr, ibv_sge, ibv_wc, ibv_wc_flags,
    ibv_wc_opcode, ibv_wc_status, ibv_wr_opcode, imm_data_invalidated_rkey_union_t, rdma_cm_id,
    rdma_destroy_qp,
};

use super::{Shared, VerbsFabric, cvt_errno};
use crate::types::{
    AccessFlags, RecvWr, ResourceKind, SendWr, Sge, WcOpcode, WcStatus, WorkCompletion,
};
use crate::{CompletionQueue, MemoryRegion, ProtectionDomain, QueuePair};

/// Completions moved out of the CQ per `ibv_poll_cq` call.
const POLL_BATCH: usize = 16;

// =============================================================================
// Protection domain / memory region
// =============================================================================

/// Protection domain on the identifier's device.
pub struct VerbsPd {
    shared: Arc<Shared>,
    pd: NonNull<ibv_pd>,
}

// SAFETY: a PD is an immutable handle once allocated.
unsafe impl Send for VerbsPd {}
unsafe impl Sync for VerbsPd {}

impl VerbsPd {
    pub(crate) fn alloc(shared: Arc<Shared>, device: *mut ibv_context) -> io::Result<Self> {
        let pd = unsafe { ibv_alloc_pd(device) };
        let pd = NonNull::new(pd).ok_or_else(io::Error::last_os_error)?;
        shared.tally.acquire(ResourceKind::Pd);
        Ok(Self { shared, pd })
    }

    pub(crate) fn as_ptr(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }
}

impl Drop for VerbsPd {
    fn drop(&mut self) {
        let ret = unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
        if ret != 0 {
            tracing::warn!(error = %io::Error::from_raw_os_error(ret), "ibv_dealloc_pd failed");
        }
        self.shared.tally.release(ResourceKind::Pd);
    }
}

pub(crate) fn ibv_access(access: AccessFlags) -> i32 {
    let mut bits = 0;
    if access.contains(AccessFlags::LOCAL_WRITE) {
        bits |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        bits |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
    }
    if access.contains(AccessFlags::REMOTE_READ) {
        bits |= ibv_access_flags::IBV_ACCESS_REMOTE_READ.0;
    }
    if access.contains(AccessFlags::REMOTE_ATOMIC) {
        bits |= ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC.0;
    }
    bits as i32
}

impl ProtectionDomain<VerbsFabric> for VerbsPd {
    unsafe fn register(
        &self,
        addr: *mut u8,
        len: usize,
        access: AccessFlags,
    ) -> io::Result<VerbsMr> {
        if !access.is_valid() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mr = unsafe { ibv_reg_mr(self.pd.as_ptr(), addr.cast(), len as _, ibv_access(access)) };
        let mr = NonNull::new(mr).ok_or_else(io::Error::last_os_error)?;
        self.shared.tally.acquire(ResourceKind::Mr);
        Ok(VerbsMr {
            shared: self.shared.clone(),
            mr,
        })
    }
}

/// Memory region registered with the device.
pub struct VerbsMr {
    shared: Arc<Shared>,
    mr: NonNull<ibv_mr>,
}

// SAFETY: the MR fields read here never change after registration.
unsafe impl Send for VerbsMr {}
unsafe impl Sync for VerbsMr {}

impl MemoryRegion for VerbsMr {
    fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    fn rkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    fn addr(&self) -> *mut u8 {
        unsafe { (*self.mr.as_ptr()).addr.cast() }
    }

    fn len(&self) -> usize {
        unsafe { (*self.mr.as_ptr()).length as usize }
    }
}

impl Drop for VerbsMr {
    fn drop(&mut self) {
        let ret = unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
        if ret != 0 {
            tracing::warn!(error = %io::Error::from_raw_os_error(ret), "ibv_dereg_mr failed");
        }
        self.shared.tally.release(ResourceKind::Mr);
    }
}

// =============================================================================
// Completion queue
// =============================================================================

/// Completion queue on the identifier's device.
pub struct VerbsCq {
    shared: Arc<Shared>,
    cq: NonNull<ibv_cq>,
}

// SAFETY: the provider locks the CQ inside `ibv_poll_cq`.
unsafe impl Send for VerbsCq {}
unsafe impl Sync for VerbsCq {}

impl VerbsCq {
    pub(crate) fn create(shared: Arc<Shared>, device: *mut ibv_context, depth: u32) -> io::Result<Self> {
        let depth = depth.min(i32::MAX as u32) as i32;
        let cq = unsafe { ibv_create_cq(device, depth, ptr::null_mut(), ptr::null_mut(), 0) };
        let cq = NonNull::new(cq).ok_or_else(io::Error::last_os_error)?;
        shared.tally.acquire(ResourceKind::Cq);
        Ok(Self { shared, cq })
    }

    pub(crate) fn as_ptr(&self) -> *mut ibv_cq {
        self.cq.as_ptr()
    }
}

fn status_of(wc: &ibv_wc) -> WcStatus {
    match wc.status {
        ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
        ibv_wc_status::IBV_WC_LOC_LEN_ERR => WcStatus::LocLenErr,
        ibv_wc_status::IBV_WC_LOC_PROT_ERR => WcStatus::LocProtErr,
        ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::WrFlushErr,
        ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => WcStatus::RemInvReqErr,
        ibv_wc_status::IBV_WC_RETRY_EXC_ERR => WcStatus::RetryExcErr,
        ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => WcStatus::RnrRetryExcErr,
        other => {
            tracing::debug!(status = other as u32, vendor_err = wc.vendor_err, "unmapped completion status");
            WcStatus::GeneralErr
        }
    }
}

/// Translate a polled CQE. Only `wr_id`, `status` and `qp_num` are defined
/// for failed completions; the poller looks at the status first.
pub(crate) fn completion(wc: &ibv_wc) -> WorkCompletion {
    let opcode = match wc.opcode {
        ibv_wc_opcode::IBV_WC_RECV | ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::Recv,
        _ => WcOpcode::Send,
    };
    let imm_data = (wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0)
        .then(|| u32::from_be(unsafe { wc.imm_data_invalidated_rkey_union.imm_data }));
    WorkCompletion {
        wr_id: wc.wr_id,
        status: status_of(wc),
        opcode,
        byte_len: wc.byte_len,
        imm_data,
        qp_num: wc.qp_num,
    }
}

impl CompletionQueue for VerbsCq {
    fn poll(&self, wc: &mut [WorkCompletion]) -> io::Result<usize> {
        // SAFETY: `ibv_wc` is plain data.
        let mut raw: [ibv_wc; POLL_BATCH] = unsafe { mem::zeroed() };
        let want = wc.len().min(POLL_BATCH);
        let n = unsafe { ibv_poll_cq(self.cq.as_ptr(), want as i32, raw.as_mut_ptr()) };
        if n < 0 {
            return Err(io::Error::other("ibv_poll_cq failed"));
        }
        let n = n as usize;
        for (out, cqe) in wc.iter_mut().zip(&raw[..n]) {
            *out = completion(cqe);
        }
        Ok(n)
    }
}

impl Drop for VerbsCq {
    fn drop(&mut self) {
        let ret = unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
        if ret != 0 {
            tracing::warn!(error = %io::Error::from_raw_os_error(ret), "ibv_destroy_cq failed");
        }
        self.shared.tally.release(ResourceKind::Cq);
    }
}

// =============================================================================
// Queue pair
// =============================================================================

/// RC queue pair created through `rdma_create_qp`; librdmacm moves it
/// through INIT/RTR/RTS during connect and accept.
pub struct VerbsQp {
    shared: Arc<Shared>,
    id: NonNull<rdma_cm_id>,
    qp: NonNull<ibv_qp>,
}

// SAFETY: `ibv_post_send` / `ibv_post_recv` are thread-safe per QP.
unsafe impl Send for VerbsQp {}
unsafe impl Sync for VerbsQp {}

impl VerbsQp {
    pub(crate) fn attach(shared: Arc<Shared>, id: NonNull<rdma_cm_id>, qp: NonNull<ibv_qp>) -> Self {
        shared.tally.acquire(ResourceKind::Qp);
        Self { shared, id, qp }
    }
}

fn raw_sge(sge: &Sge) -> ibv_sge {
    ibv_sge {
        addr: sge.addr,
        length: sge.length,
        lkey: sge.lkey,
    }
}

impl QueuePair for VerbsQp {
    fn qp_num(&self) -> u32 {
        unsafe { (*self.qp.as_ptr()).qp_num }
    }

    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        let mut sge = raw_sge(&wr.sge);
        let mut raw = ibv_send_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
            opcode: ibv_wr_opcode::IBV_WR_SEND_WITH_IMM,
            send_flags: if wr.signaled {
                ibv_send_flags::IBV_SEND_SIGNALED.0
            } else {
                0
            },
            imm_data_invalidated_rkey_union: imm_data_invalidated_rkey_union_t {
                imm_data: wr.imm_data.to_be(),
            },
            // SAFETY: the remaining union of remote addressing stays zero
            // for a two-sided send.
            ..unsafe { mem::zeroed() }
        };
        let mut bad = ptr::null_mut();
        cvt_errno(unsafe { ibv_post_send(self.qp.as_ptr(), &mut raw, &mut bad) })
    }

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        let mut sge = raw_sge(&wr.sge);
        let mut raw = ibv_recv_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sge,
            num_sge: 1,
        };
        let mut bad = ptr::null_mut();
        cvt_errno(unsafe { ibv_post_recv(self.qp.as_ptr(), &mut raw, &mut bad) })
    }
}

impl Drop for VerbsQp {
    fn drop(&mut self) {
        // The identifier outlives its QP; see `CmId`.
        unsafe { rdma_destroy_qp(self.id.as_ptr()) };
        self.shared.tally.release(ResourceKind::Qp);
    }
}
