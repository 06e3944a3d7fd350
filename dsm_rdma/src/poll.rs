//! Completion queue polling.
//!
//! Completion queues are polled, never armed for interrupts. A blocking
//! poll spins for `spin_iterations` empty polls, then yields or sleeps with
//! an additive backoff, and warns every `warn_interval` empty polls. There
//! is no overall timeout: a blocking poll ends with a completion, a fatal
//! completion status, or a state change of the connection.

use std::thread;
use std::time::Duration;

use fabric::{CompletionQueue, Fabric, WcOpcode, WcStatus, WorkCompletion};

use crate::cm::{CmSignal, ConnState};
use crate::config::{PollBackoff, TransportConfig};
use crate::error::{Error, Result, defect};
use crate::slot::RecvPool;

/// Additive sleep backoff: 1µs, 2µs, ... up to a cap.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    current: Duration,
    cap: Duration,
}

impl Backoff {
    const STEP: Duration = Duration::from_micros(1);

    pub(crate) fn new(cap: Duration) -> Self {
        Self {
            current: Duration::ZERO,
            cap,
        }
    }

    /// The next sleep interval.
    pub(crate) fn next(&mut self) -> Duration {
        self.current = (self.current + Self::STEP).min(self.cap);
        self.current
    }

    pub(crate) fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Polls one connection's completion queues.
pub(crate) struct Poller<'a> {
    conn: u64,
    signal: &'a CmSignal,
    config: &'a TransportConfig,
}

impl<'a> Poller<'a> {
    pub(crate) fn new(conn: u64, signal: &'a CmSignal, config: &'a TransportConfig) -> Self {
        Self {
            conn,
            signal,
            config,
        }
    }

    /// Fail if the connection can no longer make progress.
    pub(crate) fn check_state(&self) -> Result<()> {
        if self.signal.is_closed() {
            return Err(Error::Released);
        }
        match self.signal.state() {
            ConnState::Error => Err(Error::ConnectionError),
            ConnState::Disconnected => Err(Error::Disconnected),
            _ => Ok(()),
        }
    }

    /// Take one completion of kind `expect` from `cq`.
    ///
    /// Flushed work requests are skipped. Any other error status moves the
    /// connection to ERROR. An empty queue returns `WouldBlock` unless
    /// `blocking`.
    pub(crate) fn poll<C: CompletionQueue>(
        &self,
        cq: &C,
        expect: WcOpcode,
        blocking: bool,
    ) -> Result<WorkCompletion> {
        let mut retries: u64 = 0;
        let mut backoff = Backoff::new(self.config.backoff_cap);
        let mut wc = [WorkCompletion::EMPTY; 1];
        loop {
            self.check_state()?;

            let n = cq.poll(&mut wc).inspect_err(|e| {
                tracing::error!(conn = self.conn, error = %e, "completion queue failed");
                self.signal.fail();
            })?;
            if n == 1 {
                let wc = wc[0];
                if wc.status == WcStatus::WrFlushErr {
                    tracing::trace!(conn = self.conn, wr_id = wc.wr_id, "skipping flushed work request");
                    continue;
                }
                if !wc.is_success() {
                    tracing::error!(
                        conn = self.conn,
                        wr_id = wc.wr_id,
                        status = %wc.status,
                        "work request failed"
                    );
                    self.signal.fail();
                    return Err(Error::Completion {
                        wr_id: wc.wr_id,
                        status: wc.status,
                    });
                }
                if wc.opcode != expect {
                    return Err(defect("completion on the wrong queue"));
                }
                if retries > self.config.spin_iterations {
                    tracing::debug!(conn = self.conn, wr_id = wc.wr_id, retries, "completion after backoff");
                }
                return Ok(wc);
            }

            if !blocking {
                return Err(Error::WouldBlock);
            }
            retries += 1;
            if retries > self.config.spin_iterations {
                match self.config.poll_backoff {
                    PollBackoff::Yield => thread::yield_now(),
                    PollBackoff::Sleep => thread::sleep(backoff.next()),
                }
            } else {
                std::hint::spin_loop();
            }
            if retries.is_multiple_of(self.config.warn_interval) {
                tracing::warn!(conn = self.conn, retries, ?expect, "waiting for completion too long");
            }
        }
    }

    /// Take one receive completion, then repost every free receive slot.
    pub(crate) fn poll_recv<F: Fabric>(
        &self,
        cq: &F::Cq,
        pool: &mut RecvPool<F>,
        qp: &F::Qp,
    ) -> Result<WorkCompletion> {
        let wc = self.poll(cq, WcOpcode::Recv, false)?;
        pool.replenish(qp)?;
        Ok(wc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    use parking_lot::Mutex;

    /// Completion queue fed by the test.
    struct ScriptedCq(Mutex<VecDeque<io::Result<WorkCompletion>>>);

    impl ScriptedCq {
        fn new(items: Vec<io::Result<WorkCompletion>>) -> Self {
            Self(Mutex::new(items.into()))
        }
    }

    impl CompletionQueue for ScriptedCq {
        fn poll(&self, wc: &mut [WorkCompletion]) -> io::Result<usize> {
            match self.0.lock().pop_front() {
                Some(Ok(c)) => {
                    wc[0] = c;
                    Ok(1)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn wc(wr_id: u64, status: WcStatus, opcode: WcOpcode) -> io::Result<WorkCompletion> {
        Ok(WorkCompletion {
            wr_id,
            status,
            opcode,
            ..WorkCompletion::EMPTY
        })
    }

    fn config() -> TransportConfig {
        TransportConfig::default().with_spin_iterations(4)
    }

    #[test]
    fn test_backoff_is_additive_and_capped() {
        let mut backoff = Backoff::new(Duration::from_micros(3));
        assert_eq!(backoff.next(), Duration::from_micros(1));
        assert_eq!(backoff.next(), Duration::from_micros(2));
        assert_eq!(backoff.next(), Duration::from_micros(3));
        assert_eq!(backoff.next(), Duration::from_micros(3));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_micros(1));
    }

    #[test]
    fn test_flush_is_skipped() {
        let signal = CmSignal::new();
        let config = config();
        let poller = Poller::new(1, &signal, &config);
        let cq = ScriptedCq::new(vec![
            wc(1, WcStatus::WrFlushErr, WcOpcode::Send),
            wc(2, WcStatus::Success, WcOpcode::Send),
        ]);
        assert_eq!(poller.poll(&cq, WcOpcode::Send, false).unwrap().wr_id, 2);
        assert_eq!(signal.state(), ConnState::Init);
    }

    #[test]
    fn test_error_status_is_fatal() {
        let signal = CmSignal::new();
        let config = config();
        let poller = Poller::new(1, &signal, &config);
        let cq = ScriptedCq::new(vec![wc(7, WcStatus::RetryExcErr, WcOpcode::Send)]);
        let err = poller.poll(&cq, WcOpcode::Send, true).unwrap_err();
        assert!(matches!(
            err,
            Error::Completion {
                wr_id: 7,
                status: WcStatus::RetryExcErr
            }
        ));
        assert_eq!(signal.state(), ConnState::Error);
        // Later polls fail without touching the queue.
        assert!(matches!(
            poller.poll(&cq, WcOpcode::Send, false),
            Err(Error::ConnectionError)
        ));
    }

    #[test]
    fn test_overrun_is_fatal() {
        let signal = CmSignal::new();
        let config = config();
        let poller = Poller::new(1, &signal, &config);
        let cq = ScriptedCq::new(vec![Err(io::Error::other("overrun"))]);
        assert!(matches!(
            poller.poll(&cq, WcOpcode::Recv, false),
            Err(Error::Io(_))
        ));
        assert_eq!(signal.state(), ConnState::Error);
    }

    #[test]
    fn test_wrong_opcode_is_defect() {
        let signal = CmSignal::new();
        let config = config();
        let poller = Poller::new(1, &signal, &config);
        let cq = ScriptedCq::new(vec![wc(0, WcStatus::Success, WcOpcode::Recv)]);
        assert!(poller.poll(&cq, WcOpcode::Send, false).unwrap_err().is_defect());
    }

    #[test]
    fn test_empty_queue_nonblocking() {
        let signal = CmSignal::new();
        let config = config();
        let poller = Poller::new(1, &signal, &config);
        let cq = ScriptedCq::new(vec![]);
        assert!(poller.poll(&cq, WcOpcode::Recv, false).unwrap_err().is_would_block());
    }

    #[test]
    fn test_state_checked_before_polling() {
        let signal = CmSignal::new();
        signal.notify(Some(ConnState::Disconnected));
        let config = config();
        let poller = Poller::new(1, &signal, &config);
        let cq = ScriptedCq::new(vec![wc(1, WcStatus::Success, WcOpcode::Send)]);
        assert!(matches!(
            poller.poll(&cq, WcOpcode::Send, true),
            Err(Error::Disconnected)
        ));
        // The completion was left in the queue.
        assert_eq!(cq.0.lock().len(), 1);
    }

    #[test]
    fn test_blocking_poll_ends_on_disconnect() {
        let signal = std::sync::Arc::new(CmSignal::new());
        let config = config();
        let cq = ScriptedCq::new(vec![]);
        let waker = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.notify(Some(ConnState::Disconnected));
            })
        };
        let poller = Poller::new(1, &signal, &config);
        assert!(matches!(
            poller.poll(&cq, WcOpcode::Send, true),
            Err(Error::Disconnected)
        ));
        waker.join().unwrap();
    }
}
