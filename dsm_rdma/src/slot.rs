//! Send and receive slot pools.
//!
//! Each pool owns one page-aligned buffer, registered with the connection's
//! protection domain and carved into fixed-size slots. A slot is always in
//! one of three states:
//!
//! ```text
//!        allocate / post            completion decoded
//! FREE ─────────────────► POSTED ─────────────────────► DECODED
//!   ▲                                                      │
//!   └──────────────── consumed (receive: reposted) ◄───────┘
//! ```
//!
//! Send slots never reach DECODED: the send completion frees them directly.
//! Hardware refers to a send slot by its transaction id and to a receive
//! slot by its pool index.

use std::ffi::c_void;
use std::io;

use fabric::{AccessFlags, Fabric, MemoryRegion, ProtectionDomain, QueuePair, RecvWr, SendWr, Sge};

use crate::error::{Error, Result, defect};
use crate::wire::{self, Trailer, TxId};

/// Alignment of pool buffers.
pub const PAGE_SIZE: usize = 4096;

/// State of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for allocation.
    Free,
    /// Handed to hardware.
    Posted,
    /// Received and decoded, waiting for a matching receive call.
    Decoded,
}

/// Slot occupancy of a connection's pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub send_free: usize,
    pub send_posted: usize,
    pub recv_free: usize,
    pub recv_posted: usize,
    pub recv_decoded: usize,
}

// =============================================================================
// Registered buffers
// =============================================================================

/// Page-aligned memory registered as one memory region.
struct SlotBuffers<F: Fabric> {
    /// Deregistered before `base` is freed.
    mr: Option<F::Mr>,
    lkey: u32,
    base: *mut u8,
    slot_len: usize,
}

// SAFETY: the buffer is exclusively owned; slots are only touched through
// the owning pool, which sits behind the connection's path locks.
unsafe impl<F: Fabric> Send for SlotBuffers<F> {}
unsafe impl<F: Fabric> Sync for SlotBuffers<F> {}

impl<F: Fabric> SlotBuffers<F> {
    fn new(pd: &F::Pd, count: usize, slot_len: usize) -> Result<Self> {
        let size = count
            .checked_mul(slot_len)
            .and_then(|size| size.checked_next_multiple_of(PAGE_SIZE))
            .ok_or(Error::InvalidConfig("slot pool too large"))?;

        let base = unsafe {
            let mut ptr: *mut c_void = std::ptr::null_mut();
            let ret = libc::posix_memalign(&mut ptr, PAGE_SIZE, size);
            if ret != 0 {
                return Err(Error::Io(io::Error::from_raw_os_error(ret)));
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, size);
            ptr as *mut u8
        };

        let mr = match unsafe { pd.register(base, size, AccessFlags::LOCAL_WRITE) } {
            Ok(mr) => mr,
            Err(e) => {
                unsafe { libc::free(base as *mut c_void) };
                return Err(e.into());
            }
        };
        tracing::trace!(addr = base as u64, size, lkey = mr.lkey(), "registered slot buffers");

        Ok(Self {
            lkey: mr.lkey(),
            mr: Some(mr),
            base,
            slot_len,
        })
    }

    fn sge(&self, index: usize, length: usize) -> Sge {
        Sge {
            addr: self.base as u64 + (index * self.slot_len) as u64,
            length: length as u32,
            lkey: self.lkey,
        }
    }

    fn slot(&self, index: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base.add(index * self.slot_len), self.slot_len) }
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.base.add(index * self.slot_len), self.slot_len)
        }
    }
}

impl<F: Fabric> Drop for SlotBuffers<F> {
    fn drop(&mut self) {
        drop(self.mr.take());
        unsafe { libc::free(self.base as *mut c_void) };
    }
}

// =============================================================================
// Send pool
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct SendSlot {
    state: SlotState,
    txid: TxId,
}

/// Send slots. Only ever FREE or POSTED.
pub(crate) struct SendPool<F: Fabric> {
    buffers: SlotBuffers<F>,
    slots: Vec<SendSlot>,
    /// Index of the most recent allocation.
    last: usize,
}

impl<F: Fabric> SendPool<F> {
    pub(crate) fn new(pd: &F::Pd, count: usize, slot_len: usize) -> Result<Self> {
        Ok(Self {
            buffers: SlotBuffers::new(pd, count, slot_len)?,
            slots: vec![
                SendSlot {
                    state: SlotState::Free,
                    txid: TxId::ANY,
                };
                count
            ],
            last: count.saturating_sub(1),
        })
    }

    /// Claim the first FREE slot after the previous allocation and mark it
    /// POSTED for `txid`.
    ///
    /// Exhaustion is a defect: the send lock admits one outstanding send per
    /// connection.
    pub(crate) fn allocate(&mut self, txid: TxId) -> Result<usize> {
        let n = self.slots.len();
        for step in 1..=n {
            let index = (self.last + step) % n;
            let slot = &mut self.slots[index];
            if slot.state == SlotState::Free {
                slot.state = SlotState::Posted;
                slot.txid = txid;
                self.last = index;
                return Ok(index);
            }
        }
        Err(defect("send pool exhausted"))
    }

    /// Slot in `state` allocated for exactly `txid`.
    pub(crate) fn find(&self, txid: TxId, state: SlotState) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state == state && s.txid == txid)
    }

    /// Copy `payload` and the trailer tail into the slot and build the work
    /// request. The work request id is the transaction id.
    pub(crate) fn prepare(&mut self, index: usize, payload: &[u8], trailer: &Trailer) -> Result<SendWr> {
        let max = self.buffers.slot_len - wire::TAIL_SIZE;
        let len = wire::encode_message(self.buffers.slot_mut(index), payload, trailer).ok_or(
            Error::MessageTooLarge {
                len: payload.len(),
                max,
            },
        )?;
        Ok(SendWr {
            wr_id: trailer.txid.0 as u64,
            sge: self.buffers.sge(index, len),
            imm_data: trailer.imm(),
            signaled: true,
        })
    }

    /// The send completed: POSTED → FREE.
    pub(crate) fn complete(&mut self, index: usize) -> Result<()> {
        match self.slots.get_mut(index) {
            Some(slot) if slot.state == SlotState::Posted => {
                slot.state = SlotState::Free;
                Ok(())
            }
            _ => Err(defect("send completion for a slot that was not posted")),
        }
    }

    /// Return a slot whose send never reached the wire.
    pub(crate) fn abandon(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.state = SlotState::Free;
        }
    }

    pub(crate) fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }
}

// =============================================================================
// Receive pool
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RecvSlot {
    state: SlotState,
    trailer: Trailer,
    /// Payload length, trailer tail excluded.
    payload_len: usize,
}

/// Receive slots. Every FREE slot is reposted eagerly.
pub(crate) struct RecvPool<F: Fabric> {
    buffers: SlotBuffers<F>,
    slots: Vec<RecvSlot>,
}

impl<F: Fabric> RecvPool<F> {
    pub(crate) fn new(pd: &F::Pd, count: usize, slot_len: usize) -> Result<Self> {
        Ok(Self {
            buffers: SlotBuffers::new(pd, count, slot_len)?,
            slots: vec![
                RecvSlot {
                    state: SlotState::Free,
                    trailer: Trailer::default(),
                    payload_len: 0,
                };
                count
            ],
        })
    }

    /// First slot in `state` whose transaction `want` accepts.
    pub(crate) fn find(&self, want: TxId, state: SlotState) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state == state && want.accepts(s.trailer.txid))
    }

    /// Any FREE slot.
    pub(crate) fn allocate(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.state == SlotState::Free)
    }

    fn post(&mut self, index: usize, qp: &F::Qp) -> Result<()> {
        let wr = RecvWr {
            wr_id: index as u64,
            sge: self.buffers.sge(index, self.buffers.slot_len),
        };
        self.slots[index].state = SlotState::Posted;
        if let Err(e) = qp.post_recv(&wr) {
            self.slots[index].state = SlotState::Free;
            return Err(e.into());
        }
        Ok(())
    }

    /// Post every FREE slot. Returns how many were posted.
    pub(crate) fn replenish(&mut self, qp: &F::Qp) -> Result<usize> {
        let mut posted = 0;
        while let Some(index) = self.allocate() {
            self.post(index, qp)?;
            posted += 1;
        }
        Ok(posted)
    }

    /// Record a receive completion for slot `index`: POSTED → DECODED.
    ///
    /// Returns the transaction id found in the trailer.
    pub(crate) fn decode(&mut self, index: usize, imm: Option<u32>, byte_len: u32) -> Result<TxId> {
        match self.slots.get(index) {
            Some(slot) if slot.state == SlotState::Posted => {}
            Some(_) => return Err(defect("receive completion for a slot that was not posted")),
            None => return Err(defect("receive completion for an unknown slot")),
        }
        let imm = imm.ok_or_else(|| defect("receive completion without immediate data"))?;
        let (payload_len, trailer) =
            wire::decode_message(self.buffers.slot(index), byte_len as usize, imm)
                .ok_or_else(|| defect("receive completion shorter than the trailer"))?;
        self.slots[index] = RecvSlot {
            state: SlotState::Decoded,
            trailer,
            payload_len,
        };
        Ok(trailer.txid)
    }

    /// Copy a DECODED message into `out`, free the slot and repost it.
    ///
    /// If `out` is too small the message stays DECODED.
    pub(crate) fn take(&mut self, index: usize, out: &mut [u8], qp: &F::Qp) -> Result<(usize, Trailer)> {
        let slot = match self.slots.get(index) {
            Some(slot) if slot.state == SlotState::Decoded => *slot,
            _ => return Err(defect("consuming a slot that was not decoded")),
        };
        let len = slot.payload_len;
        if out.len() < len {
            return Err(Error::BufferTooSmall {
                needed: len,
                len: out.len(),
            });
        }
        out[..len].copy_from_slice(&self.buffers.slot(index)[..len]);
        self.slots[index].state = SlotState::Free;
        if let Err(e) = self.post(index, qp) {
            // Stays FREE until the next `replenish`.
            tracing::warn!(slot = index, error = %e, "failed to repost receive slot");
        }
        Ok((len, slot.trailer))
    }

    pub(crate) fn count(&self, state: SlotState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }

    #[cfg(test)]
    fn fill(&mut self, index: usize, bytes: &[u8]) {
        self.buffers.slot_mut(index)[..bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fabric::soft::{SoftFabric, SoftId, SoftPd, SoftQp};
    use fabric::{CmEvent, CmEventHandler, CmId, QpCap};
    use proptest::prelude::*;

    struct Quiet;

    impl CmEventHandler<SoftFabric> for Quiet {
        fn on_event(&self, _event: CmEvent<SoftFabric>) {}
    }

    /// A bound identifier with a protection domain, enough to register
    /// memory and create a queue pair.
    struct Device {
        fabric: SoftFabric,
        id: SoftId,
        pd: SoftPd,
    }

    fn device() -> Device {
        let fabric = SoftFabric::new().unwrap();
        let id = fabric.create_id(Arc::new(Quiet)).unwrap();
        id.bind_addr("127.0.0.1:7000".parse().unwrap()).unwrap();
        let pd = id.alloc_pd().unwrap();
        Device { fabric, id, pd }
    }

    fn qp(dev: &Device, recv_wr: u32) -> (SoftQp, fabric::soft::SoftCq) {
        let cq = dev.id.create_cq(64).unwrap();
        let cap = QpCap {
            max_recv_wr: recv_wr,
            ..Default::default()
        };
        (dev.id.create_qp(&dev.pd, &cq, &cq, &cap).unwrap(), cq)
    }

    #[test]
    fn test_send_allocate_scans_forward() {
        let dev = device();
        let mut pool = SendPool::<SoftFabric>::new(&dev.pd, 4, 64).unwrap();
        assert_eq!(pool.allocate(TxId(1)).unwrap(), 0);
        pool.complete(0).unwrap();
        // The next allocation starts after the previous one, not at 0.
        assert_eq!(pool.allocate(TxId(2)).unwrap(), 1);
        assert_eq!(pool.allocate(TxId(3)).unwrap(), 2);
        assert_eq!(pool.find(TxId(3), SlotState::Posted), Some(2));
        assert_eq!(pool.find(TxId(1), SlotState::Posted), None);
    }

    #[test]
    fn test_send_exhaustion_is_defect() {
        let dev = device();
        let mut pool = SendPool::<SoftFabric>::new(&dev.pd, 2, 64).unwrap();
        pool.allocate(TxId::ANY).unwrap();
        pool.allocate(TxId::ANY).unwrap();
        assert!(pool.allocate(TxId::ANY).unwrap_err().is_defect());
    }

    #[test]
    fn test_send_complete_requires_posted() {
        let dev = device();
        let mut pool = SendPool::<SoftFabric>::new(&dev.pd, 2, 64).unwrap();
        assert!(pool.complete(0).unwrap_err().is_defect());
        assert!(pool.complete(5).unwrap_err().is_defect());
    }

    #[test]
    fn test_send_prepare_layout() {
        let dev = device();
        let mut pool = SendPool::<SoftFabric>::new(&dev.pd, 2, 64).unwrap();
        let index = pool.allocate(TxId(9)).unwrap();
        let trailer = Trailer::new(0x11, 0x22, TxId(9));
        let wr = pool.prepare(index, &[1, 2, 3], &trailer).unwrap();
        assert_eq!(wr.wr_id, 9);
        assert_eq!(wr.sge.length, 5);
        assert_eq!(wr.imm_data, 0x0022_0011);
        assert_eq!(&pool.buffers.slot(index)[..5], &[1, 2, 3, 9, 0]);

        let err = pool.prepare(index, &[0u8; 63], &trailer).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { len: 63, max: 62 }));
    }

    #[test]
    fn test_recv_replenish_posts_every_free_slot() {
        let dev = device();
        let (qp, _cq) = qp(&dev, 8);
        let mut pool = RecvPool::<SoftFabric>::new(&dev.pd, 4, 64).unwrap();
        assert_eq!(pool.replenish(&qp).unwrap(), 4);
        assert_eq!(pool.count(SlotState::Posted), 4);
        assert_eq!(pool.replenish(&qp).unwrap(), 0);
    }

    #[test]
    fn test_recv_decode_requires_posted() {
        let dev = device();
        let mut pool = RecvPool::<SoftFabric>::new(&dev.pd, 2, 64).unwrap();
        assert!(pool.decode(0, Some(0), 2).unwrap_err().is_defect());
        assert!(pool.decode(7, Some(0), 2).unwrap_err().is_defect());
    }

    #[test]
    fn test_recv_match_and_take() {
        let dev = device();
        let (qp, _cq) = qp(&dev, 8);
        let mut pool = RecvPool::<SoftFabric>::new(&dev.pd, 2, 64).unwrap();
        pool.replenish(&qp).unwrap();

        pool.fill(0, &[0xAA, 0xBB, 0x05, 0x00]);
        assert_eq!(pool.decode(0, Some(0x0002_0001), 4).unwrap(), TxId(5));
        assert_eq!(pool.find(TxId(6), SlotState::Decoded), None);
        assert_eq!(pool.find(TxId(5), SlotState::Decoded), Some(0));
        assert_eq!(pool.find(TxId::ANY, SlotState::Decoded), Some(0));

        let mut small = [0u8; 1];
        let err = pool.take(0, &mut small, &qp).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { needed: 2, len: 1 }));
        assert_eq!(pool.count(SlotState::Decoded), 1);

        let mut out = [0u8; 8];
        let (len, trailer) = pool.take(0, &mut out, &qp).unwrap();
        assert_eq!(len, 2);
        assert_eq!(&out[..2], &[0xAA, 0xBB]);
        assert_eq!(trailer, Trailer::new(1, 2, TxId(5)));
        // Consumed slot went straight back to hardware.
        assert_eq!(pool.count(SlotState::Posted), 2);
    }

    #[test]
    fn test_recv_short_completion_is_defect() {
        let dev = device();
        let (qp, _cq) = qp(&dev, 8);
        let mut pool = RecvPool::<SoftFabric>::new(&dev.pd, 1, 64).unwrap();
        pool.replenish(&qp).unwrap();
        assert!(pool.decode(0, Some(0), 1).unwrap_err().is_defect());
        assert!(pool.decode(0, None, 4).unwrap_err().is_defect());
    }

    #[test]
    fn test_buffers_are_registered_and_released() {
        let dev = device();
        let before = dev.fabric.resources().mrs;
        {
            let _pool = SendPool::<SoftFabric>::new(&dev.pd, 3, 100).unwrap();
            assert_eq!(dev.fabric.resources().mrs, before + 1);
        }
        assert_eq!(dev.fabric.resources().mrs, before);
    }

    #[test]
    fn test_registration_failure_is_reported() {
        let dev = device();
        dev.fabric.fail_next_alloc(fabric::ResourceKind::Mr);
        assert!(matches!(
            RecvPool::<SoftFabric>::new(&dev.pd, 2, 64),
            Err(Error::Io(_))
        ));
    }

    proptest! {
        /// Interleaved allocations and completions never hand out a POSTED
        /// slot twice, and completing everything frees every slot.
        #[test]
        fn prop_send_slots_conserved(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
            let dev = device();
            let mut pool = SendPool::<SoftFabric>::new(&dev.pd, 4, 16).unwrap();
            let mut outstanding: Vec<usize> = Vec::new();
            for (i, alloc) in ops.into_iter().enumerate() {
                if alloc && outstanding.len() < 4 {
                    let index = pool.allocate(TxId(i as u16)).unwrap();
                    prop_assert!(!outstanding.contains(&index));
                    outstanding.push(index);
                } else if let Some(index) = outstanding.pop() {
                    pool.complete(index).unwrap();
                }
                prop_assert_eq!(pool.count(SlotState::Posted), outstanding.len());
            }
            for index in outstanding.drain(..) {
                pool.complete(index).unwrap();
            }
            prop_assert_eq!(pool.count(SlotState::Free), 4);
        }
    }
}
