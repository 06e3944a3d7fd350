//! Hardware provider over librdmacm and libibverbs.
//!
//! Enabled with the `verbs` feature. One `rdma_event_channel` serves every
//! identifier of a [`VerbsFabric`]; a dispatcher thread reads it, acks each
//! event, and hands the translated [`CmEvent`] to the handler registered for
//! the identifier. Acking before dispatch lets a handler destroy the
//! identifier (dropping an unaccepted `ConnectRequest` rejects it) without
//! deadlocking `rdma_destroy_id`.
//!
//! Identifiers find their handler through `rdma_cm_id::context`, which holds
//! a provider-wide key rather than a pointer.

mod id;
mod resources;

use std::collections::HashMap;
use std::ffi::c_void;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::Mutex;
use rdma_sys::{
    rdma_ack_cm_event, rdma_cm_event, rdma_cm_event_type, rdma_cm_id, rdma_create_event_channel,
    rdma_destroy_event_channel, rdma_event_channel, rdma_get_cm_event,
};

use crate::types::{CmEvent, ResourceCounts, ResourceTally};
use crate::{CmEventHandler, Fabric};

pub use id::VerbsId;
pub use resources::{VerbsCq, VerbsMr, VerbsPd, VerbsQp};

/// How long the dispatcher sleeps in `poll(2)` before rechecking shutdown.
const POLL_INTERVAL_MS: i32 = 100;

type Handler = Arc<dyn CmEventHandler<VerbsFabric>>;

pub(crate) struct Shared {
    channel: NonNull<rdma_event_channel>,
    handlers: Mutex<HashMap<u64, Handler>>,
    pub(crate) tally: ResourceTally,
    next_key: AtomicU64,
    shutdown: AtomicBool,
    /// The handle every `VerbsFabric` clone shares; identifiers keep it alive.
    owner: OnceLock<Weak<Dispatcher>>,
}

// SAFETY: librdmacm serializes access to the event channel internally, and
// the channel is only read by the dispatcher thread.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    pub(crate) fn channel(&self) -> *mut rdma_event_channel {
        self.channel.as_ptr()
    }

    pub(crate) fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, handler: Handler) -> u64 {
        let key = self.next_key();
        self.handlers.lock().insert(key, handler);
        key
    }

    pub(crate) fn set_handler(&self, key: u64, handler: Handler) {
        self.handlers.lock().insert(key, handler);
    }

    pub(crate) fn unregister(&self, key: u64) {
        // The handler may own the last handle of something that locks; drop
        // it after unlocking.
        let handler = self.handlers.lock().remove(&key);
        drop(handler);
    }

    fn handler(&self, key: u64) -> Option<Handler> {
        self.handlers.lock().get(&key).cloned()
    }

    fn fabric(&self) -> Option<VerbsFabric> {
        let inner = self.owner.get()?.upgrade()?;
        Some(VerbsFabric { inner })
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Every identifier holds an `Arc<Shared>`, so none is left here.
        unsafe { rdma_destroy_event_channel(self.channel.as_ptr()) };
    }
}

pub(crate) fn key_of(id: *mut rdma_cm_id) -> u64 {
    unsafe { (*id).context as usize as u64 }
}

pub(crate) fn key_ptr(key: u64) -> *mut c_void {
    key as usize as *mut c_void
}

// =============================================================================
// Event dispatch
// =============================================================================

/// An event copied out of the channel before it was acked.
enum Received {
    Event(CmEvent<VerbsFabric>),
    ConnectRequest,
    Ignored(u32),
}

struct Taken {
    what: Received,
    id: *mut rdma_cm_id,
    listen_id: *mut rdma_cm_id,
    status: i32,
}

/// Copy what the dispatcher needs out of `event` and ack it.
///
/// # Safety
/// `event` must come from `rdma_get_cm_event` and not be acked yet.
unsafe fn take_event(event: *mut rdma_cm_event) -> Taken {
    let raw = unsafe { &*event };
    let what = match raw.event {
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => Received::Event(CmEvent::AddrResolved),
        rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => Received::Event(CmEvent::AddrError),
        rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => Received::Event(CmEvent::RouteResolved),
        rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => Received::Event(CmEvent::RouteError),
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => Received::ConnectRequest,
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_RESPONSE => {
            Received::Event(CmEvent::ConnectResponse)
        }
        rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => Received::Event(CmEvent::ConnectError),
        rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => Received::Event(CmEvent::Unreachable),
        rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => Received::Event(CmEvent::Rejected),
        rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => Received::Event(CmEvent::Established),
        rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => Received::Event(CmEvent::Disconnected),
        rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => Received::Event(CmEvent::DeviceRemoval),
        rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT => Received::Event(CmEvent::TimewaitExit),
        other => Received::Ignored(other as u32),
    };
    let taken = Taken {
        what,
        id: raw.id,
        listen_id: raw.listen_id,
        status: raw.status,
    };
    unsafe { rdma_ack_cm_event(event) };
    taken
}

fn dispatch(shared: &Arc<Shared>, taken: Taken) {
    match taken.what {
        Received::ConnectRequest => {
            let listener = key_of(taken.listen_id);
            let Some(id) = NonNull::new(taken.id) else {
                tracing::warn!(listener, "connect request without an identifier");
                return;
            };
            let Some(fabric) = shared.fabric() else {
                tracing::warn!(listener, "connect request after the fabric was dropped");
                unsafe { rdma_sys::rdma_destroy_id(id.as_ptr()) };
                return;
            };
            // The child inherits the listener's context; give it its own key.
            let child = VerbsId::adopt(fabric, id);
            match shared.handler(listener) {
                Some(handler) => {
                    tracing::debug!(listener, child = child.key(), "connect request");
                    handler.on_event(CmEvent::ConnectRequest(child));
                }
                None => {
                    tracing::debug!(listener, "connect request for a destroyed listener");
                    drop(child);
                }
            }
        }
        Received::Event(event) => {
            let key = key_of(taken.id);
            if matches!(event, CmEvent::Rejected | CmEvent::ConnectError | CmEvent::Unreachable) {
                tracing::debug!(key, event = event.name(), status = taken.status, "connection refused");
            }
            match shared.handler(key) {
                Some(handler) => handler.on_event(event),
                None => tracing::trace!(key, event = event.name(), "event for a destroyed identifier"),
            }
        }
        Received::Ignored(kind) => {
            tracing::debug!(key = key_of(taken.id), kind, "ignoring cm event");
        }
    }
}

fn run_dispatcher(shared: Arc<Shared>) {
    let fd = unsafe { (*shared.channel()).fd };
    while !shared.shutdown.load(Ordering::Acquire) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL_MS) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(error = %err, "polling the cm event channel failed");
            break;
        }
        if ready == 0 {
            continue;
        }

        let mut event = ptr::null_mut();
        if unsafe { rdma_get_cm_event(shared.channel(), &mut event) } != 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "rdma_get_cm_event failed");
            continue;
        }
        let taken = unsafe { take_event(event) };
        dispatch(&shared, taken);
    }
    tracing::debug!("cm dispatcher stopped");
}

// =============================================================================
// VerbsFabric
// =============================================================================

/// Stops the dispatcher once the last `VerbsFabric` clone and the last
/// identifier are gone.
struct Dispatcher {
    shared: Arc<Shared>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }
}

/// RDMA provider backed by the devices librdmacm can reach.
///
/// Clones share the event channel and the dispatcher thread.
#[derive(Clone)]
pub struct VerbsFabric {
    inner: Arc<Dispatcher>,
}

impl VerbsFabric {
    /// Open an event channel and start its dispatcher.
    pub fn new() -> io::Result<Self> {
        let channel = unsafe { rdma_create_event_channel() };
        let channel = NonNull::new(channel).ok_or_else(io::Error::last_os_error)?;
        let shared = Arc::new(Shared {
            channel,
            handlers: Mutex::new(HashMap::new()),
            tally: ResourceTally::default(),
            next_key: AtomicU64::new(1),
            shutdown: AtomicBool::new(false),
            owner: OnceLock::new(),
        });
        let inner = Arc::new(Dispatcher {
            shared: shared.clone(),
        });
        let _ = shared.owner.set(Arc::downgrade(&inner));
        thread::Builder::new()
            .name("verbs-cm".into())
            .spawn(move || run_dispatcher(shared))?;
        Ok(Self { inner })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    /// Whether libibverbs sees at least one RDMA device.
    pub fn has_device() -> bool {
        let mut count = 0;
        let list = unsafe { rdma_sys::ibv_get_device_list(&mut count) };
        if list.is_null() {
            return false;
        }
        unsafe { rdma_sys::ibv_free_device_list(list) };
        count > 0
    }
}

impl Fabric for VerbsFabric {
    type Id = VerbsId;
    type Pd = VerbsPd;
    type Mr = VerbsMr;
    type Cq = VerbsCq;
    type Qp = VerbsQp;

    fn create_id(&self, handler: Arc<dyn CmEventHandler<Self>>) -> io::Result<VerbsId> {
        VerbsId::create(self.clone(), handler)
    }

    fn resources(&self) -> ResourceCounts {
        self.shared().tally.snapshot()
    }
}

/// Map a librdmacm return value (`-1` and `errno`) to `io::Result`.
pub(crate) fn cvt(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Map a verbs return value (an errno) to `io::Result`.
pub(crate) fn cvt_errno(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret))
    }
}

pub(crate) fn not_bound() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "identifier is not bound to a device")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_key_roundtrip() {
        let mut id: rdma_cm_id = unsafe { std::mem::zeroed() };
        id.context = key_ptr(42);
        assert_eq!(key_of(&mut id), 42);
    }

    #[test]
    fn test_cvt_errno() {
        assert!(cvt_errno(0).is_ok());
        let err = cvt_errno(libc::ENOMEM).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    }
}
