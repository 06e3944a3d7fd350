//! Verbs data types shared by every provider.
//!
//! These mirror the `ibv_*` / `rdma_cm_*` structures closely enough that a
//! provider backed by real hardware can translate them field by field.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::Fabric;

bitflags! {
    /// Memory access flags for Memory Region registration.
    ///
    /// Local read access is always enabled for the MR.
    ///
    /// # Important
    /// If `REMOTE_WRITE` or `REMOTE_ATOMIC` is set, then `LOCAL_WRITE` must also be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Enable local write access.
        const LOCAL_WRITE = 1 << 0;
        /// Enable remote write access.
        /// Requires `LOCAL_WRITE` to be set.
        const REMOTE_WRITE = 1 << 1;
        /// Enable remote read access.
        const REMOTE_READ = 1 << 2;
        /// Enable remote atomic operation access.
        /// Requires `LOCAL_WRITE` to be set.
        const REMOTE_ATOMIC = 1 << 3;
    }
}

impl AccessFlags {
    /// Whether this combination is accepted by `ibv_reg_mr`.
    pub fn is_valid(self) -> bool {
        !self.intersects(Self::REMOTE_WRITE | Self::REMOTE_ATOMIC)
            || self.contains(Self::LOCAL_WRITE)
    }
}

/// Scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    /// Start address of the local buffer.
    pub addr: u64,
    /// Length in bytes.
    pub length: u32,
    /// Local key of the MR covering `[addr, addr + length)`.
    pub lkey: u32,
}

/// Send work request. The opcode is always SEND_WITH_IMM.
#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    /// Caller-chosen correlation id, returned in the completion.
    pub wr_id: u64,
    /// Single data segment.
    pub sge: Sge,
    /// Immediate data delivered alongside the receive completion.
    pub imm_data: u32,
    /// Generate a completion on the send CQ.
    pub signaled: bool,
}

/// Receive work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    /// Caller-chosen correlation id, returned in the completion.
    pub wr_id: u64,
    /// Single data segment the incoming message is scattered into.
    pub sge: Sge,
}

/// Work completion status, a subset of `ibv_wc_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// Local length error: the message did not fit the posted receive.
    LocLenErr,
    /// Local protection error: the SGE is not covered by a registered MR.
    LocProtErr,
    /// Work request flushed because the QP entered the error state.
    WrFlushErr,
    /// Remote invalid request (e.g. the remote receive was too short).
    RemInvReqErr,
    /// Transport retry counter exceeded.
    RetryExcErr,
    /// Receiver-not-ready retry counter exceeded.
    RnrRetryExcErr,
    /// Any other error.
    GeneralErr,
}

impl WcStatus {
    /// Human readable status string, as `ibv_wc_status_str` prints it.
    pub fn as_str(&self) -> &'static str {
        match self {
            WcStatus::Success => "success",
            WcStatus::LocLenErr => "local length error",
            WcStatus::LocProtErr => "local protection error",
            WcStatus::WrFlushErr => "Work Request Flushed Error",
            WcStatus::RemInvReqErr => "remote invalid request error",
            WcStatus::RetryExcErr => "transport retry counter exceeded",
            WcStatus::RnrRetryExcErr => "RNR retry counter exceeded",
            WcStatus::GeneralErr => "general error",
        }
    }
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Completion opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// Requester completion of a SEND.
    Send,
    /// Responder completion of an incoming SEND.
    Recv,
}

/// Work completion, the polled form of a CQE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// The `wr_id` of the completed work request.
    pub wr_id: u64,
    /// Completion status.
    pub status: WcStatus,
    /// Operation that completed.
    pub opcode: WcOpcode,
    /// Number of bytes received (receive completions only).
    pub byte_len: u32,
    /// Immediate data, present when the sender used SEND_WITH_IMM.
    pub imm_data: Option<u32>,
    /// QP number the work request was posted on.
    pub qp_num: u32,
}

impl WorkCompletion {
    /// A zeroed completion, useful for preallocated poll arrays.
    pub const EMPTY: Self = Self {
        wr_id: 0,
        status: WcStatus::Success,
        opcode: WcOpcode::Send,
        byte_len: 0,
        imm_data: None,
        qp_num: 0,
    };

    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Connection parameters for `connect` / `accept` (`rdma_conn_param`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnParam {
    /// Transport retries on timeout. 7 is the maximum.
    pub retry_count: u8,
    /// Receiver-not-ready retries. 7 means retry forever.
    pub rnr_retry_count: u8,
    /// Outstanding RDMA READ/atomic operations accepted from the peer.
    pub responder_resources: u8,
    /// Outstanding RDMA READ/atomic operations issued to the peer.
    pub initiator_depth: u8,
}

impl Default for ConnParam {
    fn default() -> Self {
        Self {
            retry_count: 7,
            rnr_retry_count: 7,
            responder_resources: 0,
            initiator_depth: 0,
        }
    }
}

/// Queue pair capabilities (`ibv_qp_cap`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCap {
    /// Maximum number of outstanding send WRs.
    pub max_send_wr: u32,
    /// Maximum number of outstanding receive WRs.
    pub max_recv_wr: u32,
    /// Maximum number of SGEs per send WR.
    pub max_send_sge: u32,
    /// Maximum number of SGEs per receive WR.
    pub max_recv_sge: u32,
    /// Maximum inline data size.
    pub max_inline_data: u32,
}

impl Default for QpCap {
    fn default() -> Self {
        Self {
            max_send_wr: 64,
            max_recv_wr: 64,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 0,
        }
    }
}

/// Resource classes tracked by [`ResourceCounts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Id,
    Pd,
    Cq,
    Qp,
    Mr,
}

/// Live resource counts of a fabric.
///
/// Every handle increments its class on creation and decrements it on drop,
/// so a fully torn-down application observes [`ResourceCounts::is_empty`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub ids: usize,
    pub pds: usize,
    pub cqs: usize,
    pub qps: usize,
    pub mrs: usize,
}

impl ResourceCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn get(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Id => self.ids,
            ResourceKind::Pd => self.pds,
            ResourceKind::Cq => self.cqs,
            ResourceKind::Qp => self.qps,
            ResourceKind::Mr => self.mrs,
        }
    }
}

/// Live handle counters backing [`crate::Fabric::resources`].
#[derive(Debug, Default)]
pub(crate) struct ResourceTally([AtomicUsize; 5]);

impl ResourceTally {
    fn slot(&self, kind: ResourceKind) -> &AtomicUsize {
        let index = match kind {
            ResourceKind::Id => 0,
            ResourceKind::Pd => 1,
            ResourceKind::Cq => 2,
            ResourceKind::Qp => 3,
            ResourceKind::Mr => 4,
        };
        &self.0[index]
    }

    pub(crate) fn acquire(&self, kind: ResourceKind) {
        self.slot(kind).fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self, kind: ResourceKind) {
        self.slot(kind).fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn snapshot(&self) -> ResourceCounts {
        let count = |kind| self.slot(kind).load(Ordering::Acquire);
        ResourceCounts {
            ids: count(ResourceKind::Id),
            pds: count(ResourceKind::Pd),
            cqs: count(ResourceKind::Cq),
            qps: count(ResourceKind::Qp),
            mrs: count(ResourceKind::Mr),
        }
    }
}

/// Connection-manager event (`rdma_cm_event_type`).
///
/// `ConnectRequest` carries the identifier of the new passive-side
/// connection; dropping it without accepting rejects the request.
pub enum CmEvent<F: Fabric> {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest(F::Id),
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
}

impl<F: Fabric> CmEvent<F> {
    /// The `RDMA_CM_EVENT_*` name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            CmEvent::AddrResolved => "ADDR_RESOLVED",
            CmEvent::AddrError => "ADDR_ERROR",
            CmEvent::RouteResolved => "ROUTE_RESOLVED",
            CmEvent::RouteError => "ROUTE_ERROR",
            CmEvent::ConnectRequest(_) => "CONNECT_REQUEST",
            CmEvent::ConnectResponse => "CONNECT_RESPONSE",
            CmEvent::ConnectError => "CONNECT_ERROR",
            CmEvent::Unreachable => "UNREACHABLE",
            CmEvent::Rejected => "REJECTED",
            CmEvent::Established => "ESTABLISHED",
            CmEvent::Disconnected => "DISCONNECTED",
            CmEvent::DeviceRemoval => "DEVICE_REMOVAL",
            CmEvent::TimewaitExit => "TIMEWAIT_EXIT",
        }
    }
}

impl<F: Fabric> fmt::Debug for CmEvent<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RDMA_CM_EVENT_{}", self.name())
    }
}
