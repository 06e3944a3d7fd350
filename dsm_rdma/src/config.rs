//! Transport configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::wire::TAIL_SIZE;

/// What a blocking poll does once it is past the spin phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBackoff {
    /// Yield the CPU between polls.
    Yield,
    /// Sleep between polls, 1µs longer each time up to
    /// [`TransportConfig::backoff_cap`].
    Sleep,
}

/// Transport configuration.
///
/// Pool sizes and buffer lengths are per connection.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Number of send slots.
    /// Default: 16
    pub send_slots: usize,
    /// Number of receive slots, all pre-posted.
    /// Default: 16
    pub recv_slots: usize,
    /// Size of each slot buffer, trailer tail included.
    /// Default: 4096
    pub buffer_len: usize,
    /// Depth of the send and receive completion queues.
    /// Default: 64
    pub cq_depth: u32,
    /// Connect attempts before a rejection becomes permanent.
    /// Default: 10
    pub connect_attempts: u32,
    /// Delay between rejected connect attempts.
    /// Default: 1s
    pub retry_delay: Duration,
    /// Bound on address and route resolution.
    /// Default: 2s
    pub resolve_timeout: Duration,
    /// Bound on waiting for ESTABLISHED after connect/accept.
    /// Default: 10s
    pub establish_timeout: Duration,
    /// Listen backlog.
    /// Default: 3
    pub backlog: u32,
    /// Empty polls before a blocking poll starts backing off.
    /// Default: 128
    pub spin_iterations: u64,
    /// A blocking poll warns every this many empty polls.
    /// Default: 10000
    pub warn_interval: u64,
    /// Backoff policy of blocking polls.
    /// Default: Sleep
    pub poll_backoff: PollBackoff,
    /// Upper bound of the additive sleep backoff.
    /// Default: 1000µs
    pub backoff_cap: Duration,
    /// Empty polls after which a DONTWAIT receive gives up.
    /// Default: 128
    pub recv_attempts: u32,
    /// How often a blocked accept re-checks its stop signal.
    /// Default: 100ms
    pub accept_wake: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_slots: 16,
            recv_slots: 16,
            buffer_len: 4096,
            cq_depth: 64,
            connect_attempts: 10,
            retry_delay: Duration::from_secs(1),
            resolve_timeout: Duration::from_millis(2000),
            establish_timeout: Duration::from_secs(10),
            backlog: 3,
            spin_iterations: 128,
            warn_interval: 10_000,
            poll_backoff: PollBackoff::Sleep,
            backoff_cap: Duration::from_micros(1000),
            recv_attempts: 128,
            accept_wake: Duration::from_millis(100),
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest payload a single message can carry.
    pub fn max_payload(&self) -> usize {
        self.buffer_len.saturating_sub(TAIL_SIZE)
    }

    /// Check that the values are consistent with each other.
    pub fn validate(&self) -> Result<()> {
        if self.send_slots == 0 || self.recv_slots == 0 {
            return Err(Error::InvalidConfig("slot pools must not be empty"));
        }
        if self.buffer_len < TAIL_SIZE || self.buffer_len > u32::MAX as usize {
            return Err(Error::InvalidConfig("buffer_len out of range"));
        }
        if (self.cq_depth as usize) < self.send_slots.max(self.recv_slots) {
            return Err(Error::InvalidConfig("cq_depth smaller than a slot pool"));
        }
        if self.send_slots > u32::MAX as usize || self.recv_slots > u32::MAX as usize {
            return Err(Error::InvalidConfig("slot pool larger than a queue pair"));
        }
        if self.connect_attempts == 0 {
            return Err(Error::InvalidConfig("connect_attempts must be at least 1"));
        }
        if self.warn_interval == 0 {
            return Err(Error::InvalidConfig("warn_interval must be non-zero"));
        }
        if self.accept_wake.is_zero() {
            return Err(Error::InvalidConfig("accept_wake must be non-zero"));
        }
        Ok(())
    }

    /// Set the number of send slots.
    pub fn with_send_slots(mut self, send_slots: usize) -> Self {
        self.send_slots = send_slots;
        self
    }

    /// Set the number of receive slots.
    pub fn with_recv_slots(mut self, recv_slots: usize) -> Self {
        self.recv_slots = recv_slots;
        self
    }

    /// Set the slot buffer length.
    pub fn with_buffer_len(mut self, buffer_len: usize) -> Self {
        self.buffer_len = buffer_len;
        self
    }

    /// Set the completion queue depth.
    pub fn with_cq_depth(mut self, cq_depth: u32) -> Self {
        self.cq_depth = cq_depth;
        self
    }

    /// Set the maximum number of connect attempts.
    pub fn with_connect_attempts(mut self, connect_attempts: u32) -> Self {
        self.connect_attempts = connect_attempts;
        self
    }

    /// Set the delay between rejected connect attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Set the address/route resolution timeout.
    pub fn with_resolve_timeout(mut self, resolve_timeout: Duration) -> Self {
        self.resolve_timeout = resolve_timeout;
        self
    }

    /// Set the establishment timeout.
    pub fn with_establish_timeout(mut self, establish_timeout: Duration) -> Self {
        self.establish_timeout = establish_timeout;
        self
    }

    /// Set the listen backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the number of spinning polls.
    pub fn with_spin_iterations(mut self, spin_iterations: u64) -> Self {
        self.spin_iterations = spin_iterations;
        self
    }

    /// Set the long-poll warning interval.
    pub fn with_warn_interval(mut self, warn_interval: u64) -> Self {
        self.warn_interval = warn_interval;
        self
    }

    /// Set the blocking poll backoff policy.
    pub fn with_poll_backoff(mut self, poll_backoff: PollBackoff) -> Self {
        self.poll_backoff = poll_backoff;
        self
    }

    /// Set the cap of the sleep backoff.
    pub fn with_backoff_cap(mut self, backoff_cap: Duration) -> Self {
        self.backoff_cap = backoff_cap;
        self
    }

    /// Set the DONTWAIT receive attempt bound.
    pub fn with_recv_attempts(mut self, recv_attempts: u32) -> Self {
        self.recv_attempts = recv_attempts;
        self
    }

    /// Set the accept wake interval.
    pub fn with_accept_wake(mut self, accept_wake: Duration) -> Self {
        self.accept_wake = accept_wake;
        self
    }
}
