//! Session tests against scripted mock brokers.
//!
//! The broker side runs on a plain std thread with blocking sockets; the
//! client under test runs on the tokio test runtime.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use stompede::frame::HeartBeat;
use stompede::{connect, dial, AckMode, Options, StompError};

const CONNECTED: &[u8] = b"CONNECTED\nversion:1.2\n\n\0";

/// Read one frame (bytes up to and including NUL, NUL stripped) from the
/// broker side. Skips heart-beat pulses and inter-frame padding.
fn read_frame(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => match byte[0] {
                0 => break,
                b'\n' if buf.is_empty() => continue,
                b => buf.push(b),
            },
            Err(e) => panic!("broker read failed: {e}"),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn header_value<'a>(frame: &'a str, name: &str) -> Option<&'a str> {
    frame
        .lines()
        .skip(1)
        .take_while(|l| !l.is_empty())
        .find_map(|l| l.strip_prefix(name).and_then(|rest| rest.strip_prefix(':')))
}

/// Spawn a scripted broker that accepts one connection, performs the
/// CONNECTED handshake, then runs `script` on the accepted socket.
fn spawn_broker<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let connect_frame = read_frame(&mut stream);
        assert!(connect_frame.starts_with("CONNECT\n"), "{connect_frame}");
        stream.write_all(CONNECTED).expect("write CONNECTED");
        script(stream);
    });
    (port, handle)
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn handshake_then_send() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let connect_frame = read_frame(&mut stream);
        assert!(connect_frame.starts_with("CONNECT\n"), "{connect_frame}");
        assert_eq!(
            header_value(&connect_frame, "accept-version"),
            Some("1.0,1.1,1.2")
        );
        assert_eq!(header_value(&connect_frame, "heart-beat"), Some("5000,5000"));
        assert!(header_value(&connect_frame, "host")
            .map(|h| h.starts_with("127.0.0.1:"))
            .unwrap_or(false));
        stream.write_all(CONNECTED).unwrap();

        let send_frame = read_frame(&mut stream);
        assert!(send_frame.starts_with("SEND\n"), "{send_frame}");
        assert_eq!(header_value(&send_frame, "destination"), Some("/queue/test"));
        assert_eq!(header_value(&send_frame, "content-length"), Some("8"));
        assert!(send_frame.ends_with("\npayload\n"), "{send_frame}");
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let options = Options {
        heart_beat: Some(HeartBeat::new(5000, 5000)),
        ..Default::default()
    };
    let (session, connected) = connect(transport, options).await.unwrap();
    assert_eq!(connected.command, "CONNECTED");
    assert_eq!(connected.header_str("version"), Some("1.2"));
    assert!(!session.is_closed());

    let reply = session.send("/queue/test", b"payload", None, None).await.unwrap();
    assert!(reply.is_none());
    broker.join().unwrap();
}

#[tokio::test]
async fn handshake_error_frame_fails_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_frame(&mut stream);
        stream
            .write_all(b"ERROR\nmessage:access denied\n\nno soup for you\0")
            .unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let err = connect(transport, Options::default()).await.unwrap_err();
    match err {
        StompError::ProtocolViolation(msg) => {
            assert!(msg.contains("ERROR"), "{msg}");
            assert!(msg.contains("access denied"), "{msg}");
        }
        other => panic!("expected ProtocolViolation, got {:?}", other),
    }
    broker.join().unwrap();
}

#[tokio::test]
async fn handshake_eof_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let broker = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_frame(&mut stream);
        drop(stream);
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let err = connect(transport, Options::default()).await.unwrap_err();
    assert!(
        matches!(
            err,
            StompError::ProtocolViolation(_) | StompError::Transport(_)
        ),
        "unexpected error: {:?}",
        err
    );
    broker.join().unwrap();
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn subscribe_assigns_sequential_ids() {
    let (port, broker) = spawn_broker(|mut stream| {
        let first = read_frame(&mut stream);
        assert!(first.starts_with("SUBSCRIBE\n"), "{first}");
        assert_eq!(header_value(&first, "id"), Some("0"));
        assert_eq!(header_value(&first, "destination"), Some("/queue/a"));
        assert_eq!(header_value(&first, "ack"), Some("auto"));

        let second = read_frame(&mut stream);
        assert_eq!(header_value(&second, "id"), Some("1"));
        assert_eq!(header_value(&second, "ack"), Some("client"));
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();

    let (first, reply) = session.subscribe("/queue/a", None, AckMode::Auto).await.unwrap();
    assert_eq!(first.id, "0");
    assert!(reply.is_none());
    let (second, _) = session.subscribe("/queue/b", None, AckMode::Client).await.unwrap();
    assert_eq!(second.id, "1");

    let subs = session.subscriptions();
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0].destination, "/queue/a");
    broker.join().unwrap();
}

#[tokio::test]
async fn subscribe_with_receipt_returns_receipt_not_message() {
    let (port, broker) = spawn_broker(|mut stream| {
        let sub = read_frame(&mut stream);
        let receipt = header_value(&sub, "receipt").expect("receipt header").to_owned();
        // A delivery raced ahead of the receipt; the reply path must still
        // hand the caller the RECEIPT.
        stream
            .write_all(b"MESSAGE\nsubscription:0\nmessage-id:m1\ndestination:/q\n\nearly\n\0")
            .unwrap();
        stream
            .write_all(format!("RECEIPT\nreceipt-id:{receipt}\n\n\0").as_bytes())
            .unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    let (mut deliveries, _errors) = session.receive().expect("streams");

    let (_sub, reply) = session
        .subscribe("/q", Some("sub-rcpt-1"), AckMode::Auto)
        .await
        .unwrap();
    let reply = reply.expect("receipt expected");
    assert_eq!(reply.command, "RECEIPT");
    assert_eq!(reply.header_str("receipt-id"), Some("sub-rcpt-1"));

    let delivery = deliveries.recv().await.expect("delivery");
    assert_eq!(delivery.command, "MESSAGE");
    assert_eq!(delivery.body, b"early\n");
    broker.join().unwrap();
}

#[tokio::test]
async fn unsubscribe_removes_zeroth_subscription() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _ = read_frame(&mut stream); // SUBSCRIBE 0
        let _ = read_frame(&mut stream); // SUBSCRIBE 1
        let unsub = read_frame(&mut stream);
        assert!(unsub.starts_with("UNSUBSCRIBE\n"), "{unsub}");
        assert_eq!(header_value(&unsub, "id"), Some("0"));
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    session.subscribe("/queue/a", None, AckMode::Auto).await.unwrap();
    session.subscribe("/queue/b", None, AckMode::Auto).await.unwrap();

    session.unsubscribe("0", None).await.unwrap();
    let subs = session.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].id, "1");
    broker.join().unwrap();
}

#[tokio::test]
async fn subscribe_empty_destination_rejected() {
    let (port, broker) = spawn_broker(|_stream| {});
    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    let err = session.subscribe("", None, AckMode::Auto).await.unwrap_err();
    assert!(matches!(err, StompError::InvalidArgument(_)));
    broker.join().unwrap();
}

// =============================================================================
// Transactions and acks on the wire
// =============================================================================

#[tokio::test]
async fn transaction_and_ack_frames() {
    let (port, broker) = spawn_broker(|mut stream| {
        let begin = read_frame(&mut stream);
        assert!(begin.starts_with("BEGIN\n"));
        assert_eq!(header_value(&begin, "transaction"), Some("tx1"));

        let ack = read_frame(&mut stream);
        assert!(ack.starts_with("ACK\n"));
        assert_eq!(header_value(&ack, "id"), Some("m1"));
        assert_eq!(header_value(&ack, "transaction"), Some("tx1"));

        let nack = read_frame(&mut stream);
        assert!(nack.starts_with("NACK\n"));
        assert_eq!(header_value(&nack, "id"), Some("m2"));

        let commit = read_frame(&mut stream);
        assert!(commit.starts_with("COMMIT\n"));
        assert_eq!(header_value(&commit, "transaction"), Some("tx1"));
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    session.begin("tx1", None).await.unwrap();
    session.ack("m1", None, Some("tx1")).await.unwrap();
    session.nack("m2", None, None).await.unwrap();
    session.commit("tx1", None).await.unwrap();
    broker.join().unwrap();
}

#[tokio::test]
async fn send_with_receipt_blocks_for_reply() {
    let (port, broker) = spawn_broker(|mut stream| {
        let send = read_frame(&mut stream);
        let receipt = header_value(&send, "receipt").expect("receipt").to_owned();
        stream
            .write_all(format!("RECEIPT\nreceipt-id:{receipt}\n\n\0").as_bytes())
            .unwrap();
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    let reply = session
        .send("/q", b"important", Some("r-77"), None)
        .await
        .unwrap()
        .expect("reply");
    assert_eq!(reply.command, "RECEIPT");
    assert_eq!(reply.header_str("receipt-id"), Some("r-77"));
    broker.join().unwrap();
}

#[tokio::test]
async fn strict_content_length_counts_body_only() {
    let (port, broker) = spawn_broker(|mut stream| {
        let send = read_frame(&mut stream);
        assert_eq!(header_value(&send, "content-length"), Some("7"));
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let options = Options {
        strict_content_length: true,
        ..Default::default()
    };
    let (session, _) = connect(transport, options).await.unwrap();
    session.send("/q", b"payload", None, None).await.unwrap();
    broker.join().unwrap();
}

// =============================================================================
// Deliveries and the error stream
// =============================================================================

#[tokio::test]
async fn deliveries_arrive_in_wire_order() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _ = read_frame(&mut stream); // SUBSCRIBE
        stream
            .write_all(b"MESSAGE\nsubscription:0\nmessage-id:m1\ndestination:/q\n\nfirst\n\0")
            .unwrap();
        // Brokers may pad with a line feed between frames.
        stream.write_all(b"\n").unwrap();
        stream
            .write_all(b"MESSAGE\nsubscription:0\nmessage-id:m2\ndestination:/q\n\nsecond\n\0")
            .unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    let (mut deliveries, _errors) = session.receive().expect("streams");
    session.subscribe("/q", None, AckMode::Auto).await.unwrap();

    let first = deliveries.recv().await.expect("first delivery");
    assert_eq!(first.header_str("message-id"), Some("m1"));
    assert_eq!(first.body, b"first\n");
    let second = deliveries.recv().await.expect("second delivery");
    assert_eq!(second.header_str("message-id"), Some("m2"));
    assert_eq!(second.body, b"second\n");

    assert!(session.receive().is_none(), "streams are taken once");
    broker.join().unwrap();
}

#[tokio::test]
async fn malformed_frame_reported_and_pump_continues() {
    let (port, broker) = spawn_broker(|mut stream| {
        stream.write_all(b"GARBAGE\0").unwrap();
        stream
            .write_all(b"MESSAGE\nsubscription:0\nmessage-id:m1\ndestination:/q\n\nstill here\n\0")
            .unwrap();
        thread::sleep(Duration::from_millis(100));
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    let (mut deliveries, mut errors) = session.receive().expect("streams");

    let err = errors.recv().await.expect("pump error");
    assert!(matches!(err, StompError::MalformedFrame(_)));
    let delivery = deliveries.recv().await.expect("delivery after bad frame");
    assert_eq!(delivery.body, b"still here\n");
    broker.join().unwrap();
}

#[tokio::test]
async fn transport_eof_closes_session() {
    let (port, broker) = spawn_broker(|stream| {
        drop(stream);
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    let (mut deliveries, _errors) = session.receive().expect("streams");
    assert!(deliveries.recv().await.is_none(), "stream ends on EOF");

    // Give the closed flag a beat to settle, then writes must fail.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.is_closed());
    let err = session.send("/q", b"x", None, None).await.unwrap_err();
    assert!(matches!(
        err,
        StompError::SessionClosed | StompError::Transport(_)
    ));
    broker.join().unwrap();
}

// =============================================================================
// Disconnect
// =============================================================================

#[tokio::test]
async fn disconnect_validates_matching_receipt() {
    let (port, broker) = spawn_broker(|mut stream| {
        let disco = read_frame(&mut stream);
        assert!(disco.starts_with("DISCONNECT\n"), "{disco}");
        let receipt = header_value(&disco, "receipt").expect("receipt").to_owned();
        stream
            .write_all(format!("RECEIPT\nreceipt-id:{receipt}\n\n\0").as_bytes())
            .unwrap();
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    session.disconnect().await.unwrap();
    assert!(session.is_closed());

    let err = session.send("/q", b"after", None, None).await.unwrap_err();
    assert!(matches!(err, StompError::SessionClosed));
    broker.join().unwrap();
}

#[tokio::test]
async fn disconnect_receipt_mismatch_is_violation_but_closes() {
    let (port, broker) = spawn_broker(|mut stream| {
        let _ = read_frame(&mut stream); // DISCONNECT
        stream.write_all(b"RECEIPT\nreceipt-id:wrong\n\n\0").unwrap();
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    let err = session.disconnect().await.unwrap_err();
    match err {
        StompError::ProtocolViolation(msg) => assert!(msg.contains("wrong"), "{msg}"),
        other => panic!("expected ProtocolViolation, got {:?}", other),
    }
    assert!(session.is_closed());

    let err = session.send("/q", b"after", None, None).await.unwrap_err();
    assert!(matches!(err, StompError::SessionClosed));
    broker.join().unwrap();
}

#[tokio::test]
async fn second_disconnect_reports_closed() {
    let (port, broker) = spawn_broker(|mut stream| {
        let disco = read_frame(&mut stream);
        let receipt = header_value(&disco, "receipt").expect("receipt").to_owned();
        stream
            .write_all(format!("RECEIPT\nreceipt-id:{receipt}\n\n\0").as_bytes())
            .unwrap();
    });

    let transport = dial("127.0.0.1", port).await.unwrap();
    let (session, _) = connect(transport, Options::default()).await.unwrap();
    session.disconnect().await.unwrap();
    let err = session.disconnect().await.unwrap_err();
    assert!(matches!(err, StompError::SessionClosed));
    broker.join().unwrap();
}
