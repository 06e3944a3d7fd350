//! `rdma_cm_id` wrapper.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;

use rdma_sys::{
    ibv_qp_cap, ibv_qp_init_attr, ibv_qp_type, rdma_accept, rdma_bind_addr, rdma_cm_id,
    rdma_conn_param, rdma_connect, rdma_create_id, rdma_create_qp, rdma_destroy_id,
    rdma_disconnect, rdma_listen, rdma_port_space, rdma_reject, rdma_resolve_addr,
    rdma_resolve_route,
};

use super::resources::{VerbsCq, VerbsPd, VerbsQp};
use super::{VerbsFabric, cvt, key_ptr, not_bound};
use crate::types::{ConnParam, QpCap, ResourceKind};
use crate::{CmEventHandler, CmId};

/// Connection identifier on a [`VerbsFabric`].
pub struct VerbsId {
    fabric: VerbsFabric,
    id: NonNull<rdma_cm_id>,
    key: u64,
}

// SAFETY: librdmacm calls on one identifier are thread-safe; the pointer is
// destroyed exactly once, in `Drop`.
unsafe impl Send for VerbsId {}
unsafe impl Sync for VerbsId {}

impl std::fmt::Debug for VerbsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerbsId").field("key", &self.key).finish()
    }
}

impl VerbsId {
    pub(crate) fn create(
        fabric: VerbsFabric,
        handler: Arc<dyn CmEventHandler<VerbsFabric>>,
    ) -> io::Result<Self> {
        let shared = fabric.shared().clone();
        let key = shared.register(handler);
        let mut id = ptr::null_mut();
        let ret = unsafe {
            rdma_create_id(
                shared.channel(),
                &mut id,
                key_ptr(key),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        let id = match cvt(ret).and_then(|()| NonNull::new(id).ok_or_else(io::Error::last_os_error)) {
            Ok(id) => id,
            Err(e) => {
                shared.unregister(key);
                return Err(e);
            }
        };
        shared.tally.acquire(ResourceKind::Id);
        Ok(Self { fabric, id, key })
    }

    /// Take ownership of the identifier a connect request created.
    ///
    /// Until [`CmId::set_handler`] is called its events are dropped.
    pub(crate) fn adopt(fabric: VerbsFabric, id: NonNull<rdma_cm_id>) -> Self {
        let shared = fabric.shared();
        let key = shared.next_key();
        // SAFETY: `id` came from a CONNECT_REQUEST event and nobody else
        // owns it yet.
        unsafe { (*id.as_ptr()).context = key_ptr(key) };
        shared.tally.acquire(ResourceKind::Id);
        Self { fabric, id, key }
    }

    /// Provider-wide key of this identifier, used in logs.
    pub fn key(&self) -> u64 {
        self.key
    }

    fn raw(&self) -> *mut rdma_cm_id {
        self.id.as_ptr()
    }

    /// Device context the identifier is bound to, once resolved or bound.
    fn device(&self) -> io::Result<*mut rdma_sys::ibv_context> {
        let verbs = unsafe { (*self.raw()).verbs };
        if verbs.is_null() {
            Err(not_bound())
        } else {
            Ok(verbs)
        }
    }

    /// Read one of the two socket addresses in `route.addr`: the source at
    /// offset 0, the destination one `sockaddr_storage` later.
    fn route_addr(&self, offset: usize) -> Option<SocketAddrV4> {
        let sin = unsafe {
            let base = ptr::addr_of!((*self.raw()).route.addr).cast::<u8>();
            base.add(offset).cast::<libc::sockaddr_in>().read_unaligned()
        };
        from_sockaddr(&sin)
    }
}

pub(crate) fn to_sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    }
}

pub(crate) fn from_sockaddr(sin: &libc::sockaddr_in) -> Option<SocketAddrV4> {
    if i32::from(sin.sin_family) != libc::AF_INET {
        return None;
    }
    Some(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().min(i32::MAX as u128) as i32
}

pub(crate) fn conn_param(param: &ConnParam) -> rdma_conn_param {
    rdma_conn_param {
        responder_resources: param.responder_resources,
        initiator_depth: param.initiator_depth,
        retry_count: param.retry_count,
        rnr_retry_count: param.rnr_retry_count,
        // SAFETY: the remaining fields are plain integers and a null
        // private-data pointer.
        ..unsafe { mem::zeroed() }
    }
}

impl CmId<VerbsFabric> for VerbsId {
    fn set_handler(&self, handler: Arc<dyn CmEventHandler<VerbsFabric>>) {
        self.fabric.shared().set_handler(self.key, handler);
    }

    fn resolve_addr(&self, dst: SocketAddrV4, timeout: Duration) -> io::Result<()> {
        let mut sin = to_sockaddr(dst);
        let ret = unsafe {
            rdma_resolve_addr(
                self.raw(),
                ptr::null_mut(),
                (&mut sin as *mut libc::sockaddr_in).cast(),
                timeout_ms(timeout),
            )
        };
        cvt(ret)
    }

    fn resolve_route(&self, timeout: Duration) -> io::Result<()> {
        cvt(unsafe { rdma_resolve_route(self.raw(), timeout_ms(timeout)) })
    }

    fn bind_addr(&self, addr: SocketAddrV4) -> io::Result<()> {
        let mut sin = to_sockaddr(addr);
        cvt(unsafe { rdma_bind_addr(self.raw(), (&mut sin as *mut libc::sockaddr_in).cast()) })
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        cvt(unsafe { rdma_listen(self.raw(), backlog.min(i32::MAX as u32) as i32) })
    }

    fn alloc_pd(&self) -> io::Result<VerbsPd> {
        VerbsPd::alloc(self.fabric.shared().clone(), self.device()?)
    }

    fn create_cq(&self, depth: u32) -> io::Result<VerbsCq> {
        VerbsCq::create(self.fabric.shared().clone(), self.device()?, depth)
    }

    fn create_qp(
        &self,
        pd: &VerbsPd,
        send_cq: &VerbsCq,
        recv_cq: &VerbsCq,
        cap: &QpCap,
    ) -> io::Result<VerbsQp> {
        let mut attr = ibv_qp_init_attr {
            send_cq: send_cq.as_ptr(),
            recv_cq: recv_cq.as_ptr(),
            cap: ibv_qp_cap {
                max_send_wr: cap.max_send_wr,
                max_recv_wr: cap.max_recv_wr,
                max_send_sge: cap.max_send_sge,
                max_recv_sge: cap.max_recv_sge,
                max_inline_data: cap.max_inline_data,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
            // SAFETY: null context and SRQ.
            ..unsafe { mem::zeroed() }
        };
        cvt(unsafe { rdma_create_qp(self.raw(), pd.as_ptr(), &mut attr) })?;
        let qp = unsafe { (*self.raw()).qp };
        let qp = NonNull::new(qp).ok_or_else(io::Error::last_os_error)?;
        Ok(VerbsQp::attach(self.fabric.shared().clone(), self.id, qp))
    }

    fn connect(&self, param: &ConnParam) -> io::Result<()> {
        let mut param = conn_param(param);
        cvt(unsafe { rdma_connect(self.raw(), &mut param) })
    }

    fn accept(&self, param: &ConnParam) -> io::Result<()> {
        let mut param = conn_param(param);
        cvt(unsafe { rdma_accept(self.raw(), &mut param) })
    }

    fn reject(&self) -> io::Result<()> {
        cvt(unsafe { rdma_reject(self.raw(), ptr::null(), 0) })
    }

    fn disconnect(&self) -> io::Result<()> {
        cvt(unsafe { rdma_disconnect(self.raw()) })
    }

    fn local_addr(&self) -> Option<SocketAddrV4> {
        self.route_addr(0)
    }

    fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.route_addr(mem::size_of::<libc::sockaddr_storage>())
    }
}

impl Drop for VerbsId {
    fn drop(&mut self) {
        let shared = self.fabric.shared();
        shared.unregister(self.key);
        // Events are acked before dispatch, so this never waits on the
        // dispatcher, even when called from a handler.
        if unsafe { rdma_destroy_id(self.raw()) } != 0 {
            tracing::warn!(key = self.key, error = %io::Error::last_os_error(), "rdma_destroy_id failed");
        }
        shared.tally.release(ResourceKind::Id);
    }
}
