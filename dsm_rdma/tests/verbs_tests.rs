//! Transport tests on RDMA hardware.
//!
//! Needs the `verbs` feature, an RDMA device, and `DSM_RDMA_ADDR` set to an
//! IPv4 address owned by that device. Tests skip otherwise.
//!
//! Run with:
//! ```bash
//! DSM_RDMA_ADDR=192.168.10.3 cargo test --package dsm_rdma --features verbs --test verbs_tests
//! ```

#![cfg(feature = "verbs")]

mod common;

use std::thread;

use common::{fast_config, init_tracing};
use dsm_rdma::{ConnState, MsgFlags, Trailer, Transport, TxId};
use fabric::Fabric;
use fabric::verbs::VerbsFabric;

/// Open the hardware provider, or skip the test.
macro_rules! require_device {
    () => {{
        match device() {
            Some(found) => found,
            None => {
                eprintln!("Skipping test: no RDMA device or DSM_RDMA_ADDR unset");
                return;
            }
        }
    }};
}

fn device() -> Option<(VerbsFabric, String)> {
    let host = std::env::var("DSM_RDMA_ADDR").ok()?;
    if !VerbsFabric::has_device() {
        return None;
    }
    init_tracing();
    Some((VerbsFabric::new().ok()?, host))
}

#[test]
fn test_deadbeef_roundtrip_on_device() {
    let (fabric, host) = require_device!();
    let transport = Transport::new(fabric, fast_config()).unwrap();
    let listener = transport.listen(&host, "25001").unwrap();
    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || listener.accept())
    };
    let client = transport.connect(&host, "25001").unwrap();
    let server = acceptor.join().unwrap().unwrap();
    assert_eq!(client.state(), ConnState::Connected);
    assert_eq!(server.state(), ConnState::Connected);

    client.send(&[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
    let mut buf = [0u8; 16];
    let (n, trailer) = server
        .receive_with(&mut buf, TxId::ANY, MsgFlags::empty())
        .unwrap();
    assert_eq!(&buf[..n], &[0xDE, 0xAD, 0xBE, 0xEF]);

    // Echo with a trailer, so immediate data crosses the wire both ways.
    let reply = Trailer::new(3, 9, TxId(42));
    server.send_with(b"pong", &reply).unwrap();
    let (n, got) = client
        .receive_with(&mut buf, TxId(42), MsgFlags::empty())
        .unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(got, reply);
    assert_eq!(trailer, Trailer::default());

    client.release().unwrap();
    server.release().unwrap();
    assert_eq!(listener.active_children(), 0);
    listener.release().unwrap();
    let left = transport.fabric().resources();
    assert!(left.is_empty(), "leaked resources: {left:?}");
}

#[test]
fn test_connect_without_listener_on_device() {
    let (fabric, host) = require_device!();
    let transport = Transport::new(fabric, fast_config().with_connect_attempts(2)).unwrap();
    assert!(transport.connect(&host, "25002").is_err());
    assert!(transport.fabric().resources().is_empty());
}
