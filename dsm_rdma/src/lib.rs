//! # dsm_rdma - Transactional messaging over RDMA reliable connections
//!
//! A small two-sided transport for a distributed shared memory runtime.
//! Every message travels as one SEND_WITH_IMM carrying a 6-byte trailer:
//!
//! - **Copyset and version** (16 bits each) in the immediate data
//! - **Transaction id** (16 bits, little endian) appended to the payload
//!
//! Receivers ask for a specific transaction id or the wildcard
//! [`TxId::ANY`]. Messages for other transactions are kept in their receive
//! slot until someone asks for them.
//!
//! ## Architecture
//!
//! - [`Transport`] owns a [`fabric::Fabric`] provider and the configuration
//! - [`Connection`] is one RC queue pair with its own protection domain,
//!   completion queues and fixed pools of registered send/receive slots
//! - Connection-manager events drive a per-connection state machine
//!   ([`ConnState`]) that blocking calls wait on
//! - Completion queues are polled: spin, then yield or sleep with backoff
//!
//! ## Usage
//!
//! ```ignore
//! let transport = Transport::new(SoftFabric::new()?, TransportConfig::default())?;
//! let listener = transport.listen("127.0.0.1", "23456")?;
//!
//! let client = transport.connect("127.0.0.1", "23456")?;
//! let server = listener.accept()?;
//!
//! client.send(&[0xDE, 0xAD, 0xBE, 0xEF])?;
//! let mut buf = [0u8; 16];
//! let n = server.receive(&mut buf)?;
//! ```

pub mod cm;
pub mod config;
pub mod connection;
pub mod error;
mod poll;
pub mod slot;
pub mod transfer;
pub mod wire;

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use fabric::Fabric;

pub use cm::ConnState;
pub use config::{PollBackoff, TransportConfig};
pub use connection::{Connection, Role, StopSignal};
pub use error::{Error, Result};
pub use slot::{PAGE_SIZE, PoolStats, SlotState};
pub use transfer::MsgFlags;
pub use wire::{TRAILER_SIZE, Trailer, TxId};

/// Parse a dotted IPv4 host and a decimal port.
pub fn parse_addr(host: &str, port: &str) -> Result<SocketAddrV4> {
    let ip: Ipv4Addr = host
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("bad host {host:?}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("bad port {port:?}")))?;
    Ok(SocketAddrV4::new(ip, port))
}

/// Entry point: a provider plus the configuration every connection made
/// through it shares.
pub struct Transport<F: Fabric> {
    fabric: F,
    config: Arc<TransportConfig>,
}

impl<F: Fabric> Transport<F> {
    pub fn new(fabric: F, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(?config, "transport ready");
        Ok(Self {
            fabric,
            config: Arc::new(config),
        })
    }

    /// Connect to `host:port`.
    ///
    /// Rejected attempts are retried from scratch after `retry_delay`, up
    /// to `connect_attempts` attempts in total.
    pub fn connect(&self, host: &str, port: &str) -> Result<Connection<F>> {
        let addr = parse_addr(host, port)?;
        Connection::connect(&self.fabric, &self.config, addr)
    }

    /// Listen on `host:port`. Connect requests are admitted in the
    /// background; [`Connection::accept`] completes them.
    pub fn listen(&self, host: &str, port: &str) -> Result<Connection<F>> {
        let addr = parse_addr(host, port)?;
        Connection::listen(&self.fabric, &self.config, addr)
    }

    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}
