//! Error types for the transport.

use fabric::WcStatus;

use crate::cm::ConnState;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error reported by the fabric (verbs or connection manager).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Host or port could not be parsed as dotted-decimal IPv4 / decimal port.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// A connection-manager step did not complete in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// A connection-manager step completed in the wrong state.
    #[error("unexpected connection state: expected {expected:?}, got {actual:?}")]
    UnexpectedState {
        expected: ConnState,
        actual: ConnState,
    },
    /// Every connect attempt was rejected by the remote side.
    #[error("connect rejected after {attempts} attempts")]
    ConnectRejected { attempts: u32 },
    /// The connection was torn down by the peer.
    #[error("connection disconnected")]
    Disconnected,
    /// The connection is in the ERROR state.
    #[error("connection is in error state")]
    ConnectionError,
    /// Nothing to receive yet; try again.
    #[error("operation would block")]
    WouldBlock,
    /// A stop signal aborted a blocking accept.
    #[error("shutting down")]
    ShuttingDown,
    /// A work request completed with a fatal status.
    #[error("work request {wr_id} failed: {status}")]
    Completion { wr_id: u64, status: WcStatus },
    /// Broken bookkeeping: slot in the wrong state, completion for another
    /// transaction, pool exhausted under the send lock.
    #[error("protocol defect: {0}")]
    Defect(&'static str),
    /// Payload does not fit a slot buffer.
    #[error("message of {len} bytes exceeds maximum payload of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    /// Caller buffer cannot hold the pending message; it stays queued.
    #[error("buffer of {len} bytes too small for {needed} byte message")]
    BufferTooSmall { needed: usize, len: usize },
    /// The connection has been released.
    #[error("connection released")]
    Released,
    /// `accept` on a connection that is not a listener.
    #[error("not a listener")]
    NotListener,
    /// Rejected by [`TransportConfig::validate`](crate::TransportConfig::validate).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    /// "Try again" rather than a failure.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }

    /// Bookkeeping invariant violation.
    pub fn is_defect(&self) -> bool {
        matches!(self, Error::Defect(_))
    }

    /// Cancellation by a stop signal.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::ShuttingDown)
    }
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Log and build a [`Error::Defect`].
#[inline]
pub(crate) fn defect(what: &'static str) -> Error {
    tracing::error!(defect = what, "protocol invariant violated");
    Error::Defect(what)
}
