//! # fabric - RDMA verbs and connection-manager seam
//!
//! This crate describes the slice of the verbs / RDMA-CM surface a
//! reliable-connected (RC) send/receive transport needs, as a set of traits
//! with owned, RAII resource handles:
//!
//! - [`Fabric`]: creates connection identifiers and reports live resources
//! - [`CmId`]: address/route resolution, bind/listen, connect/accept and
//!   per-identifier resource creation (PD, CQ, QP), like `rdma_cm_id`
//! - [`ProtectionDomain`] / [`MemoryRegion`]: memory registration
//! - [`CompletionQueue`]: non-blocking polling of work completions
//! - [`QueuePair`]: posting SEND_WITH_IMM and RECV work requests
//!
//! Connection-manager events are asynchronous. They are delivered to the
//! [`CmEventHandler`] registered on the identifier, from a thread owned by
//! the provider, in the order they were generated.
//!
//! ## Providers
//!
//! [`soft::SoftFabric`] is an in-process provider: identifiers bound on the
//! same `SoftFabric` can connect to each other, send-with-immediate copies
//! between registered buffers, and disconnect flushes outstanding work
//! requests exactly like an RC queue pair entering the error state.
//!
//! `verbs::VerbsFabric` (feature `verbs`) drives real hardware through
//! librdmacm and libibverbs.
//!
//! ```ignore
//! let fabric = SoftFabric::new();
//! let id = fabric.create_id(handler)?;
//! id.resolve_addr("127.0.0.1:23456".parse()?, Duration::from_secs(2))?;
//! ```

pub mod soft;
pub mod types;
#[cfg(feature = "verbs")]
pub mod verbs;

use std::io;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

pub use types::{
    AccessFlags, CmEvent, ConnParam, QpCap, RecvWr, ResourceCounts, ResourceKind, SendWr, Sge,
    WcOpcode, WcStatus, WorkCompletion,
};

/// An RDMA provider.
///
/// Handles are tied to the provider through the associated types, so a
/// transport written against `F: Fabric` never mixes resources of two
/// providers.
pub trait Fabric: Send + Sync + Sized + 'static {
    /// Connection identifier (`rdma_cm_id`).
    type Id: CmId<Self>;
    /// Protection domain (`ibv_pd`).
    type Pd: ProtectionDomain<Self>;
    /// Registered memory region (`ibv_mr`).
    type Mr: MemoryRegion;
    /// Completion queue (`ibv_cq`).
    type Cq: CompletionQueue;
    /// Queue pair (`ibv_qp`).
    type Qp: QueuePair;

    /// Create a connection identifier whose events go to `handler`.
    fn create_id(&self, handler: Arc<dyn CmEventHandler<Self>>) -> io::Result<Self::Id>;

    /// Snapshot of live resources, by class.
    fn resources(&self) -> ResourceCounts;
}

/// Receiver of asynchronous connection-manager events.
pub trait CmEventHandler<F: Fabric>: Send + Sync {
    /// Called on the provider's event thread, once per event.
    fn on_event(&self, event: CmEvent<F>);
}

/// Connection identifier.
///
/// Dropping the identifier destroys it (`rdma_destroy_id`). The queue pair,
/// CQs and PD created through it must be dropped first.
pub trait CmId<F: Fabric>: Send + Sync {
    /// Redirect future events of this identifier to `handler`.
    fn set_handler(&self, handler: Arc<dyn CmEventHandler<F>>);

    /// Start resolving `dst`. Completes with `AddrResolved` or `AddrError`.
    fn resolve_addr(&self, dst: SocketAddrV4, timeout: Duration) -> io::Result<()>;

    /// Start resolving the route to the resolved address. Completes with
    /// `RouteResolved` or `RouteError`.
    fn resolve_route(&self, timeout: Duration) -> io::Result<()>;

    /// Bind the identifier to a local address.
    fn bind_addr(&self, addr: SocketAddrV4) -> io::Result<()>;

    /// Start listening for connect requests on the bound address.
    fn listen(&self, backlog: u32) -> io::Result<()>;

    /// Allocate a protection domain on the identifier's device.
    fn alloc_pd(&self) -> io::Result<F::Pd>;

    /// Create a completion queue with at least `depth` entries.
    fn create_cq(&self, depth: u32) -> io::Result<F::Cq>;

    /// Create the RC queue pair of this identifier.
    fn create_qp(
        &self,
        pd: &F::Pd,
        send_cq: &F::Cq,
        recv_cq: &F::Cq,
        cap: &QpCap,
    ) -> io::Result<F::Qp>;

    /// Initiate a connection. Completes with `Established` or one of
    /// `Rejected` / `Unreachable` / `ConnectError`.
    fn connect(&self, param: &ConnParam) -> io::Result<()>;

    /// Accept the connect request this identifier was created for.
    /// Completes with `Established`.
    fn accept(&self, param: &ConnParam) -> io::Result<()>;

    /// Reject the connect request this identifier was created for.
    fn reject(&self) -> io::Result<()>;

    /// Disconnect. Both sides receive `Disconnected` and the queue pairs
    /// flush every outstanding work request.
    fn disconnect(&self) -> io::Result<()>;

    fn local_addr(&self) -> Option<SocketAddrV4>;

    fn peer_addr(&self) -> Option<SocketAddrV4>;
}

/// Protection domain. Deallocated on drop.
pub trait ProtectionDomain<F: Fabric>: Send + Sync {
    /// Register a memory region with the device.
    ///
    /// # Safety
    /// The caller must ensure that:
    /// - The memory region pointed to by `addr` with `len` bytes is valid
    /// - The memory region remains valid for the lifetime of the returned MR
    /// - `access` satisfies [`AccessFlags::is_valid`]
    unsafe fn register(&self, addr: *mut u8, len: usize, access: AccessFlags)
    -> io::Result<F::Mr>;
}

/// Registered memory region. Deregistered on drop.
pub trait MemoryRegion: Send + Sync {
    /// Local key used in [`Sge`].
    fn lkey(&self) -> u32;
    /// Remote key for one-sided operations.
    fn rkey(&self) -> u32;
    fn addr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Completion queue. Destroyed on drop.
pub trait CompletionQueue: Send + Sync {
    /// Move up to `wc.len()` completions into `wc`, returning how many.
    ///
    /// Returns an error if the CQ overran.
    fn poll(&self, wc: &mut [WorkCompletion]) -> io::Result<usize>;
}

/// RC queue pair. Destroyed on drop (`rdma_destroy_qp`).
pub trait QueuePair: Send + Sync {
    fn qp_num(&self) -> u32;

    /// Post a SEND_WITH_IMM work request.
    fn post_send(&self, wr: &SendWr) -> io::Result<()>;

    /// Post a receive work request.
    fn post_recv(&self, wr: &RecvWr) -> io::Result<()>;
}
