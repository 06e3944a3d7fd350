//! Common test utilities for dsm_rdma integration tests.

// Test utilities may not all be used in every test file
#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use dsm_rdma::{Connection, PollBackoff, Transport, TransportConfig};
use fabric::Fabric;
use fabric::soft::SoftFabric;
use tracing_subscriber::EnvFilter;

pub const HOST: &str = "127.0.0.1";

/// Install a test-friendly subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Defaults with short waits, so retry and teardown paths run quickly.
pub fn fast_config() -> TransportConfig {
    TransportConfig::default()
        .with_retry_delay(Duration::from_millis(10))
        .with_establish_timeout(Duration::from_secs(5))
        .with_accept_wake(Duration::from_millis(10))
        .with_spin_iterations(16)
        .with_poll_backoff(PollBackoff::Sleep)
        .with_backoff_cap(Duration::from_micros(100))
        .with_recv_attempts(16)
}

pub fn transport(config: TransportConfig) -> Transport<SoftFabric> {
    init_tracing();
    Transport::new(SoftFabric::new().expect("start soft fabric"), config).expect("transport")
}

/// A listener, a client and the server side of the client's connection.
pub struct Pair {
    pub transport: Transport<SoftFabric>,
    pub listener: Connection<SoftFabric>,
    pub client: Connection<SoftFabric>,
    pub server: Connection<SoftFabric>,
}

impl Pair {
    pub fn new(config: TransportConfig, port: u16) -> Self {
        let transport = transport(config);
        let port = port.to_string();
        let listener = transport.listen(HOST, &port).expect("listen");
        let acceptor = {
            let listener = listener.clone();
            thread::spawn(move || listener.accept())
        };
        let client = transport.connect(HOST, &port).expect("connect");
        let server = acceptor
            .join()
            .expect("acceptor panicked")
            .expect("accept");
        Self {
            transport,
            listener,
            client,
            server,
        }
    }

    pub fn fabric(&self) -> &SoftFabric {
        self.transport.fabric()
    }

    /// Release everything and check that the fabric is empty.
    pub fn teardown(self) {
        self.client.release().expect("release client");
        self.server.release().expect("release server");
        self.listener.release().expect("release listener");
        let left = self.fabric().resources();
        assert!(left.is_empty(), "leaked resources: {left:?}");
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
