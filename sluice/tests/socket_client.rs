//! SocketClient and WebSocketClient against the scripted and TCP engines

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sluice::prelude::*;
use sluice::transport::scripted::{ScriptHandle, ScriptedTransport};
use sluice::transport::tcp::TcpTransport;
use sluice::transport::{Transport, WriteKind};

#[derive(Default)]
struct Recorder {
    data: Mutex<Vec<u8>>,
    connects: Mutex<usize>,
    disconnects: Mutex<usize>,
}

impl SocketHandler for Recorder {
    fn on_connected(&self) {
        *self.connects.lock() += 1;
    }

    fn on_disconnected(&self) {
        *self.disconnects.lock() += 1;
    }

    fn on_data(&self, data: &[u8], _remaining: usize) {
        self.data.lock().extend_from_slice(data);
    }
}

fn scripted(headroom: usize) -> (Arc<Reactor>, ScriptHandle) {
    let (engine, handle) = ScriptedTransport::new();
    let engine = engine.with_headroom(headroom);
    let options = ReactorOptions::new()
        .with_pool_capacity(8)
        .with_queue_capacity(8)
        .with_idle(IdleStrategy::Park(Duration::from_millis(1)));
    let reactor = Reactor::start(options, move |_| Ok(Box::new(engine) as Box<dyn Transport>));
    (Arc::new(reactor), handle)
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_send_before_connect_fails() {
    let (reactor, _handle) = scripted(0);
    let client = SocketClient::new(reactor, Arc::new(Recorder::default()), "feed.test", 9000);
    assert!(matches!(client.send(b"early"), Err(SluiceError::NotConnected)));
    assert!(!client.is_connected());
}

#[test]
fn test_connect_is_idempotent() {
    let (reactor, handle) = scripted(0);
    let client = SocketClient::new(reactor, Arc::new(Recorder::default()), "feed.test", 9000);
    client.connect().unwrap();
    client.connect().unwrap();
    wait_for("connection", || client.is_connected());
    client.connect().unwrap();

    thread::sleep(Duration::from_millis(10));
    assert_eq!(handle.connects().len(), 1);
}

#[test]
fn test_socket_roundtrip_and_stop() {
    let (reactor, handle) = scripted(0);
    let recorder = Arc::new(Recorder::default());
    let handler = Arc::clone(&recorder) as Arc<dyn SocketHandler>;
    let client = SocketClient::new(Arc::clone(&reactor), handler, "feed.test", 9000);
    let monitor = reactor.monitor();

    client.connect().unwrap();
    wait_for("connection", || client.is_connected());
    client.send(b"subscribe").unwrap();
    wait_for("send", || handle.sent().len() == 1);
    assert_eq!(handle.sent()[0].data, b"subscribe");

    let token = handle.last_token().unwrap();
    handle.deliver(token, b"update".to_vec());
    wait_for("inbound", || recorder.data.lock().as_slice() == b"update");

    client.stop();
    let released = monitor
        .iter()
        .find(|e| matches!(e, ReactorEvent::Released { .. }));
    assert_eq!(released, Some(ReactorEvent::Released { token }));
    assert_eq!(*recorder.disconnects.lock(), 1);
    assert!(matches!(client.send(b"late"), Err(SluiceError::NotConnected)));
}

#[test]
fn test_reconnect_after_peer_close() {
    let (reactor, handle) = scripted(0);
    let recorder = Arc::new(Recorder::default());
    let handler = Arc::clone(&recorder) as Arc<dyn SocketHandler>;
    let client = SocketClient::new(reactor, handler, "feed.test", 9000);

    client.connect().unwrap();
    wait_for("connection", || client.is_connected());
    handle.close(handle.last_token().unwrap());
    wait_for("disconnect", || *recorder.disconnects.lock() == 1);
    assert!(!client.is_open());

    // No automatic retry.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(handle.connects().len(), 1);
    assert!(matches!(client.send(b"x"), Err(SluiceError::NotConnected)));

    client.reconnect().unwrap();
    wait_for("second connection", || *recorder.connects.lock() == 2);
    client.send(b"back").unwrap();
    wait_for("send", || handle.sent().len() == 1);
}

#[test]
fn test_drop_stops_session() {
    let (reactor, handle) = scripted(0);
    let client = SocketClient::new(
        Arc::clone(&reactor),
        Arc::new(Recorder::default()),
        "feed.test",
        9000,
    );
    client.connect().unwrap();
    wait_for("connection", || client.is_connected());

    drop(client);
    wait_for("teardown", || handle.open().is_empty());
}

#[test]
fn test_websocket_text_and_binary() {
    let (reactor, handle) = scripted(16);
    let handler = Arc::new(Recorder::default());
    let client = WebSocketClient::new(reactor, handler, "stream.test", 443, "/ws", true)
        .with_protocol("v2.feed");
    client.connect().unwrap();
    wait_for("handshake", || client.is_connected());

    client.send("{\"op\":\"ping\"}").unwrap();
    client.send_binary(&[1, 2, 3]).unwrap();
    wait_for("two messages", || handle.sent().len() == 2);

    let sent = handle.sent();
    assert_eq!(sent[0].kind, WriteKind::Text);
    assert_eq!(sent[0].data, b"{\"op\":\"ping\"}");
    assert_eq!(sent[1].kind, WriteKind::Binary);
    assert_eq!(sent[1].data, [1, 2, 3]);

    let (_, target) = &handle.connects()[0];
    assert_eq!(target.to_string(), "wss://stream.test:443/ws");
    assert_eq!(target.protocol.as_deref(), Some("v2.feed"));
}

#[test]
fn test_disabled_reactor_refuses_connect() {
    let reactor = Arc::new(Reactor::start(ReactorOptions::default(), |_| {
        Err(SluiceError::EngineUnavailable("no engine".into()))
    }));
    let client = SocketClient::new(reactor, Arc::new(Recorder::default()), "feed.test", 9000);
    assert!(matches!(client.connect(), Err(SluiceError::EngineUnavailable(_))));
}

#[test]
fn test_tcp_echo() {
    let port = portpicker::pick_unused_port().expect("no free port");
    let listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(&buf).unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });

    let options = ReactorOptions::new()
        .with_pool_capacity(4)
        .with_queue_capacity(4)
        .with_idle(IdleStrategy::Park(Duration::from_millis(1)));
    let reactor = Arc::new(Reactor::start(options, TcpTransport::factory));
    let recorder = Arc::new(Recorder::default());
    let handler = Arc::clone(&recorder) as Arc<dyn SocketHandler>;
    let client = SocketClient::new(Arc::clone(&reactor), handler, "127.0.0.1", port);

    client.connect().unwrap();
    wait_for("connection", || client.is_connected());
    client.send(b"ping").unwrap();
    wait_for("echo", || recorder.data.lock().as_slice() == b"ping");

    client.stop();
    server.join().unwrap();
}
