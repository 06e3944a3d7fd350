//! Send and receive.
//!
//! Each connection has a send lock and a receive lock, held by the
//! respective operation. One sender and one receiver run concurrently;
//! concurrent senders (or receivers) on the same connection serialize, so a
//! connection has at most one send in flight.

use std::thread;

use bitflags::bitflags;
use fabric::{Fabric, QueuePair, WcOpcode};

use crate::cm::ConnState;
use crate::connection::{Connection, Role};
use crate::error::{Error, Result, defect};
use crate::poll::{Backoff, Poller};
use crate::slot::SlotState;
use crate::wire::{Trailer, TxId};

bitflags! {
    /// Receive flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// Give up with `WouldBlock` after a bounded number of empty polls
        /// instead of waiting for a matching message.
        const DONTWAIT = 1 << 0;
    }
}

impl<F: Fabric> Connection<F> {
    fn poller(&self) -> Poller<'_> {
        Poller::new(self.inner.conn, &self.inner.signal, &self.inner.config)
    }

    fn require_endpoint(&self) -> Result<()> {
        if self.role() == Role::Listener {
            return Err(Error::UnexpectedState {
                expected: ConnState::Connected,
                actual: self.state(),
            });
        }
        Ok(())
    }

    /// Send `data` with the wildcard trailer. Returns `data.len()`.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.send_with(data, &Trailer::default())
    }

    /// Send `data` tagged with `trailer` and wait for its completion.
    ///
    /// The wait is unbounded: it ends with the completion, a fatal
    /// completion status, or the connection leaving CONNECTED.
    pub fn send_with(&self, data: &[u8], trailer: &Trailer) -> Result<usize> {
        self.require_endpoint()?;
        let max = self.inner.config.max_payload();
        if data.len() > max {
            return Err(Error::MessageTooLarge {
                len: data.len(),
                max,
            });
        }

        let link = self.inner.link.read();
        let link = link.as_ref().ok_or(Error::Released)?;
        let poller = self.poller();

        let mut pool = link.send.lock();
        poller.check_state()?;

        let index = pool.allocate(trailer.txid)?;
        let wr = match pool.prepare(index, data, trailer) {
            Ok(wr) => wr,
            Err(e) => {
                pool.abandon(index);
                return Err(e);
            }
        };
        tracing::debug!(conn = self.inner.conn, txid = %trailer.txid, len = data.len(), slot = index, "send");
        if let Err(e) = link.qp.post_send(&wr) {
            pool.abandon(index);
            tracing::warn!(conn = self.inner.conn, error = %e, "post_send failed");
            return Err(e.into());
        }

        let wc = match poller.poll(&link.send_cq, WcOpcode::Send, true) {
            Ok(wc) => wc,
            Err(e) => {
                pool.abandon(index);
                return Err(e);
            }
        };
        if wc.wr_id != wr.wr_id {
            pool.abandon(index);
            return Err(defect("send completion for another transaction"));
        }
        match pool.find(trailer.txid, SlotState::Posted) {
            Some(found) if found == index => pool.complete(index)?,
            _ => return Err(defect("completed send slot not found")),
        }
        Ok(data.len())
    }

    /// Receive the next message into `out`, whatever its transaction id.
    ///
    /// Gives up with `WouldBlock` if nothing arrives within the configured
    /// number of attempts.
    pub fn receive(&self, out: &mut [u8]) -> Result<usize> {
        self.receive_with(out, TxId::ANY, MsgFlags::DONTWAIT)
            .map(|(len, _)| len)
    }

    /// Receive the next message `want` accepts, with its trailer.
    ///
    /// Messages for other transactions that arrive meanwhile stay buffered
    /// for later calls. The receive lock is dropped while backing off.
    pub fn receive_with(&self, out: &mut [u8], want: TxId, flags: MsgFlags) -> Result<(usize, Trailer)> {
        self.require_endpoint()?;
        let link = self.inner.link.read();
        let link = link.as_ref().ok_or(Error::Released)?;
        let poller = self.poller();
        let mut backoff = Backoff::new(self.inner.config.backoff_cap);
        let mut retries: u32 = 0;

        let mut pool = link.recv.lock();
        loop {
            // A slot whose repost failed in `take` goes back first.
            pool.replenish(&link.qp)?;

            if let Some(index) = pool.find(want, SlotState::Decoded) {
                let (len, trailer) = pool.take(index, out, &link.qp)?;
                tracing::debug!(conn = self.inner.conn, txid = %trailer.txid, len, "received buffered message");
                return Ok((len, trailer));
            }

            match poller.poll_recv(&link.recv_cq, &mut *pool, &link.qp) {
                Ok(wc) => {
                    backoff.reset();
                    let index = wc.wr_id as usize;
                    let txid = pool.decode(index, wc.imm_data, wc.byte_len)?;
                    if want.accepts(txid) {
                        let (len, trailer) = pool.take(index, out, &link.qp)?;
                        tracing::debug!(conn = self.inner.conn, %txid, len, "received");
                        return Ok((len, trailer));
                    }
                    tracing::debug!(conn = self.inner.conn, want = %want, got = %txid, "buffering message for another transaction");
                }
                Err(Error::WouldBlock) => {
                    retries = retries.saturating_add(1);
                    drop(pool);
                    thread::sleep(backoff.next());
                    if flags.contains(MsgFlags::DONTWAIT) && retries > self.inner.config.recv_attempts {
                        return Err(Error::WouldBlock);
                    }
                    pool = link.recv.lock();
                }
                Err(e) => return Err(e),
            }
        }
    }
}
