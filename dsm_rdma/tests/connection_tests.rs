//! Connection lifecycle integration tests over the software fabric.
//!
//! Run with:
//! ```bash
//! cargo test --package dsm_rdma --test connection_tests
//! ```

mod common;

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::thread;
use std::time::Duration;

use common::{HOST, Pair, fast_config, transport, wait_until};
use dsm_rdma::{ConnState, Error, MsgFlags, Role, StopSignal, Transport, TxId};
use fabric::soft::SoftFabric;
use fabric::{Fabric, ResourceCounts, ResourceKind, WcStatus};

const WAIT: Duration = Duration::from_secs(5);

/// Resources of a lone listener.
fn listener_only() -> ResourceCounts {
    ResourceCounts {
        ids: 1,
        ..Default::default()
    }
}

#[test]
fn test_pair_metadata() {
    let pair = Pair::new(fast_config(), 24001);
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 24001);

    assert_eq!(pair.client.role(), Role::Client);
    assert_eq!(pair.server.role(), Role::AcceptedPeer);
    assert_eq!(pair.listener.role(), Role::Listener);
    assert_eq!(pair.listener.local_addr(), Some(addr));
    assert_eq!(pair.client.peer_addr(), Some(addr));
    assert_eq!(pair.server.local_addr(), Some(addr));
    assert_eq!(pair.server.peer_addr(), pair.client.local_addr());
    assert_eq!(pair.listener.active_children(), 1);
    assert_eq!(pair.listener.pending_children(), 0);
    assert_ne!(pair.client.conn_id(), pair.server.conn_id());

    pair.teardown();
}

#[test]
fn test_connect_retries_rejections() {
    let transport = transport(fast_config().with_connect_attempts(4));
    let listener = transport.listen(HOST, "24002").unwrap();
    transport.fabric().reject_next_connects(2);

    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || listener.accept())
    };
    let client = transport.connect(HOST, "24002").unwrap();
    let server = acceptor.join().unwrap().unwrap();

    assert_eq!(client.connect_attempts(), 3);
    assert_eq!(transport.fabric().connect_requests(), 3);
    assert_eq!(client.state(), ConnState::Connected);
    assert_eq!(server.state(), ConnState::Connected);

    client.release().unwrap();
    listener.release().unwrap();
    assert!(server.is_released());
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_connect_gives_up_after_max_attempts() {
    let transport = transport(fast_config().with_connect_attempts(3));
    let listener = transport.listen(HOST, "24003").unwrap();
    transport.fabric().reject_next_connects(3);

    let err = transport.connect(HOST, "24003").unwrap_err();
    assert!(matches!(err, Error::ConnectRejected { attempts: 3 }));
    assert_eq!(transport.fabric().connect_requests(), 3);
    // Every rejected attempt was torn down.
    assert_eq!(transport.fabric().resources(), listener_only());

    listener.release().unwrap();
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_connect_without_listener() {
    let transport = transport(fast_config().with_connect_attempts(2));
    let err = transport.connect(HOST, "24004").unwrap_err();
    assert!(matches!(err, Error::ConnectRejected { attempts: 2 }));
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_listener_release_tears_down_children() {
    let transport = transport(fast_config().with_connect_attempts(2));
    let listener = transport.listen(HOST, "24005").unwrap();

    // One accepted child...
    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || listener.accept())
    };
    let accepted_client = transport.connect(HOST, "24005").unwrap();
    let server = acceptor.join().unwrap().unwrap();

    // ...and one still waiting for accept.
    let waiting = {
        let fabric = transport.fabric().clone();
        let config = transport.config().clone();
        thread::spawn(move || {
            let transport = Transport::new(fabric, config).unwrap();
            transport.connect(HOST, "24005")
        })
    };
    assert!(wait_until(WAIT, || listener.pending_children() == 1));
    assert_eq!(listener.active_children(), 1);

    listener.release().unwrap();
    assert!(listener.is_released());
    assert!(server.is_released());
    assert_eq!(listener.pending_children(), 0);
    assert_eq!(listener.active_children(), 0);

    // The waiting client was rejected and found nobody listening on retry.
    let err = waiting.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectRejected { attempts: 2 }));

    // The accepted client saw its peer go away.
    assert!(wait_until(WAIT, || accepted_client.state() == ConnState::Disconnected));
    accepted_client.release().unwrap();

    assert!(transport.fabric().resources().is_empty());
    // Releasing twice is harmless.
    listener.release().unwrap();
}

#[test]
fn test_peer_release_surfaces_as_disconnect() {
    let pair = Pair::new(fast_config(), 24006);
    pair.client.release().unwrap();
    assert!(pair.client.is_released());
    assert_eq!(pair.client.pool_stats(), None);
    assert!(matches!(pair.client.send(b"x"), Err(Error::Released)));

    // Posted receives were flushed; the blocking receive ends on the
    // state change instead of hanging.
    let mut buf = [0u8; 8];
    let err = pair
        .server
        .receive_with(&mut buf, TxId::ANY, MsgFlags::empty())
        .unwrap_err();
    assert!(matches!(err, Error::Disconnected), "{err:?}");
    assert_eq!(pair.server.state(), ConnState::Disconnected);
    assert!(matches!(pair.server.send(b"x"), Err(Error::Disconnected)));

    pair.teardown();
}

#[test]
fn test_error_completion_moves_to_error() {
    let pair = Pair::new(fast_config(), 24007);
    pair.fabric().fail_next_send(WcStatus::RetryExcErr);

    let err = pair.client.send(b"boom").unwrap_err();
    assert!(
        matches!(err, Error::Completion { status: WcStatus::RetryExcErr, .. }),
        "{err:?}"
    );
    assert_eq!(pair.client.state(), ConnState::Error);

    // ERROR is sticky.
    assert!(matches!(pair.client.send(b"x"), Err(Error::ConnectionError)));
    let mut buf = [0u8; 8];
    assert!(matches!(
        pair.client.receive(&mut buf),
        Err(Error::ConnectionError)
    ));

    // Releasing a connection in ERROR still disconnects the peer.
    pair.client.release().unwrap();
    assert_eq!(pair.client.state(), ConnState::Error);
    assert!(wait_until(WAIT, || pair.server.state() == ConnState::Disconnected));

    pair.teardown();
}

#[test]
fn test_accept_until_stops() {
    let transport = transport(fast_config());
    let listener = transport.listen(HOST, "24008").unwrap();
    let stop = StopSignal::new();
    let stopper = {
        let stop = stop.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stop.stop();
        })
    };

    let err = listener.accept_until(&stop).unwrap_err();
    assert!(err.is_shutdown());
    stopper.join().unwrap();

    listener.release().unwrap();
    assert!(matches!(listener.accept(), Err(Error::Released)));
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_accept_on_client_is_refused() {
    let pair = Pair::new(fast_config(), 24009);
    assert!(matches!(pair.client.accept(), Err(Error::NotListener)));
    assert!(matches!(pair.server.accept(), Err(Error::NotListener)));
    pair.teardown();
}

#[test]
fn test_setup_failure_leaks_nothing() {
    let transport = transport(fast_config().with_connect_attempts(1));
    let listener = transport.listen(HOST, "24010").unwrap();

    for kind in [
        ResourceKind::Id,
        ResourceKind::Pd,
        ResourceKind::Cq,
        ResourceKind::Mr,
        ResourceKind::Qp,
    ] {
        transport.fabric().fail_next_alloc(kind);
        let err = transport.connect(HOST, "24010").unwrap_err();
        assert!(matches!(err, Error::Io(_)), "{kind:?}: {err:?}");
        assert_eq!(transport.fabric().resources(), listener_only(), "{kind:?}");
    }
    // Nothing reached the listener.
    assert_eq!(transport.fabric().connect_requests(), 0);
    assert_eq!(listener.pending_children(), 0);

    listener.release().unwrap();
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_invalid_addresses() {
    let transport = transport(fast_config());
    for (host, port) in [("localhost", "1"), ("127.0.0.1", "http"), ("1.2.3", "80"), ("10.0.0.1", "70000")] {
        assert!(
            matches!(transport.connect(host, port), Err(Error::InvalidAddress(_))),
            "{host}:{port}"
        );
        assert!(
            matches!(transport.listen(host, port), Err(Error::InvalidAddress(_))),
            "{host}:{port}"
        );
    }
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_unresolvable_address() {
    let transport = transport(fast_config());
    let err = transport.connect("0.0.0.0", "24011").unwrap_err();
    assert!(
        matches!(
            err,
            Error::UnexpectedState {
                expected: ConnState::AddrResolved,
                ..
            }
        ),
        "{err:?}"
    );
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_listen_twice_on_one_address() {
    let transport = transport(fast_config());
    let first = transport.listen(HOST, "24012").unwrap();
    match transport.listen(HOST, "24012") {
        Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::AddrInUse),
        other => panic!("expected AddrInUse, got {other:?}"),
    }
    assert_eq!(transport.fabric().resources(), listener_only());
    first.release().unwrap();
}

#[test]
fn test_invalid_config_is_refused() {
    let fabric = SoftFabric::new().unwrap();
    let config = fast_config().with_send_slots(0);
    assert!(matches!(
        Transport::new(fabric, config),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_released_children_leave_the_listener() {
    let transport = transport(fast_config());
    let listener = transport.listen(HOST, "24013").unwrap();

    for round in 0..5 {
        let acceptor = {
            let listener = listener.clone();
            thread::spawn(move || listener.accept())
        };
        let client = transport.connect(HOST, "24013").unwrap();
        let server = acceptor.join().unwrap().unwrap();
        assert_eq!(listener.active_children(), 1, "round {round}");

        server.release().unwrap();
        assert_eq!(listener.active_children(), 0, "round {round}");
        client.release().unwrap();
        assert_eq!(transport.fabric().resources(), listener_only(), "round {round}");
    }

    assert_eq!(listener.pending_children(), 0);
    assert_eq!(listener.active_children(), 0);
    listener.release().unwrap();
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_accept_setup_failure_lets_client_retry() {
    let transport = transport(fast_config().with_connect_attempts(2));
    let listener = transport.listen(HOST, "24014").unwrap();

    let connecting = {
        let fabric = transport.fabric().clone();
        let config = transport.config().clone();
        thread::spawn(move || {
            let transport = Transport::new(fabric, config).unwrap();
            transport.connect(HOST, "24014")
        })
    };
    assert!(wait_until(WAIT, || listener.pending_children() == 1));

    // The child's protection domain cannot be allocated: it is unwound and
    // its request rejected.
    transport.fabric().fail_next_alloc(ResourceKind::Pd);
    match listener.accept() {
        Err(Error::Io(e)) => assert_eq!(e.raw_os_error(), Some(libc::ENOMEM)),
        other => panic!("expected ENOMEM, got {other:?}"),
    }
    assert_eq!(listener.active_children(), 0);

    // The client comes back and the next accept succeeds.
    let server = listener.accept().unwrap();
    let client = connecting.join().unwrap().unwrap();
    assert_eq!(client.connect_attempts(), 2);
    assert_eq!(transport.fabric().connect_requests(), 2);
    assert_eq!(server.state(), ConnState::Connected);
    assert_eq!(listener.active_children(), 1);

    client.send(b"after retry").unwrap();
    let mut buf = [0u8; 16];
    let (len, _) = server
        .receive_with(&mut buf, TxId::ANY, MsgFlags::empty())
        .unwrap();
    assert_eq!(&buf[..len], b"after retry");

    client.release().unwrap();
    server.release().unwrap();
    listener.release().unwrap();
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_device_removal_wakes_blocked_accept() {
    let transport = transport(fast_config());
    let listener = transport.listen(HOST, "24015").unwrap();

    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || listener.accept())
    };
    thread::sleep(Duration::from_millis(20));
    transport.fabric().remove_device();

    let err = acceptor.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionError), "{err:?}");
    assert_eq!(listener.state(), ConnState::Error);
    assert!(matches!(listener.accept(), Err(Error::ConnectionError)));

    listener.release().unwrap();
    assert!(transport.fabric().resources().is_empty());
}

#[test]
fn test_device_removal_fails_connections() {
    let pair = Pair::new(fast_config(), 24016);
    pair.fabric().remove_device();

    for conn in [&pair.client, &pair.server] {
        assert!(wait_until(WAIT, || conn.state() == ConnState::Error));
        assert!(matches!(conn.send(b"x"), Err(Error::ConnectionError)));
        let mut buf = [0u8; 8];
        assert!(matches!(conn.receive(&mut buf), Err(Error::ConnectionError)));
    }

    pair.teardown();
}
