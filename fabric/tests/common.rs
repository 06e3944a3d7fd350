//! Common test utilities for the software fabric tests.

// Test utilities may not all be used in every test file
#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use fabric::soft::{SoftCq, SoftFabric, SoftId, SoftPd, SoftQp};
use fabric::{CmEvent, CmEventHandler, CmId, CompletionQueue, QpCap, WorkCompletion};

/// Page size for aligned allocations.
pub const PAGE_SIZE: usize = 4096;

/// How long a test waits for a CM event before giving up.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn addr(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

/// Aligned buffer with automatic cleanup.
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
}

impl AlignedBuffer {
    /// Allocate page-aligned, zeroed memory.
    pub fn new(size: usize) -> Self {
        let aligned_size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let ptr = unsafe {
            let mut ptr: *mut std::ffi::c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, PAGE_SIZE, aligned_size);
            if ret != 0 {
                panic!("posix_memalign failed: {}", ret);
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, aligned_size);
            ptr as *mut u8
        };
        Self {
            ptr,
            size: aligned_size,
        }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.size);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(offset), data.len()) }
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.size);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len).to_vec() }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr as *mut std::ffi::c_void) }
    }
}

// =============================================================================
// Event recording
// =============================================================================

pub enum Recorded {
    Event(&'static str),
    Request(SoftId),
}

/// Forwards every CM event to a channel.
pub struct Recorder {
    tx: mpsc::Sender<Recorded>,
}

impl CmEventHandler<SoftFabric> for Recorder {
    fn on_event(&self, event: CmEvent<SoftFabric>) {
        let recorded = match event {
            CmEvent::ConnectRequest(id) => Recorded::Request(id),
            other => Recorded::Event(other.name()),
        };
        let _ = self.tx.send(recorded);
    }
}

pub fn recorder() -> (Arc<Recorder>, mpsc::Receiver<Recorded>) {
    let (tx, rx) = mpsc::channel();
    (Arc::new(Recorder { tx }), rx)
}

/// Next non-request event name.
pub fn next_event(rx: &mpsc::Receiver<Recorded>) -> &'static str {
    match rx.recv_timeout(EVENT_TIMEOUT).expect("timed out waiting for cm event") {
        Recorded::Event(name) => name,
        Recorded::Request(_) => panic!("unexpected CONNECT_REQUEST"),
    }
}

/// Next connect request.
pub fn next_request(rx: &mpsc::Receiver<Recorded>) -> SoftId {
    match rx.recv_timeout(EVENT_TIMEOUT).expect("timed out waiting for connect request") {
        Recorded::Request(id) => id,
        Recorded::Event(name) => panic!("expected CONNECT_REQUEST, got {name}"),
    }
}

// =============================================================================
// Verbs resources
// =============================================================================

/// Per-identifier verbs resources. Fields drop in teardown order.
pub struct Verbs {
    pub qp: SoftQp,
    pub send_cq: SoftCq,
    pub recv_cq: SoftCq,
    pub pd: SoftPd,
}

impl Verbs {
    pub fn new(id: &SoftId) -> Self {
        let pd = id.alloc_pd().expect("alloc_pd");
        let send_cq = id.create_cq(16).expect("create send cq");
        let recv_cq = id.create_cq(16).expect("create recv cq");
        let cap = QpCap {
            max_send_wr: 8,
            max_recv_wr: 8,
            ..Default::default()
        };
        let qp = id
            .create_qp(&pd, &send_cq, &recv_cq, &cap)
            .expect("create_qp");
        Self {
            qp,
            send_cq,
            recv_cq,
            pd,
        }
    }
}

/// Poll one completion without waiting.
pub fn poll_one(cq: &SoftCq) -> Option<WorkCompletion> {
    let mut wc = [WorkCompletion::EMPTY; 1];
    match cq.poll(&mut wc).expect("poll cq") {
        0 => None,
        _ => Some(wc[0]),
    }
}
