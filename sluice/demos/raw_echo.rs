//! Raw socket echo over loopback.
//!
//! Starts a `SocketServer` that echoes every read back to its client,
//! connects a `SocketClient` through a reactor running the TCP engine, and
//! sends a few messages.
//!
//! Run with: `RUST_LOG=debug cargo run --example raw_echo`

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use sluice::prelude::*;
use sluice::transport::tcp::TcpTransport;

struct Echoed {
    bytes: Mutex<Vec<u8>>,
}

impl SocketHandler for Echoed {
    fn on_connected(&self) {
        println!("connected");
    }

    fn on_disconnected(&self) {
        println!("disconnected");
    }

    fn on_error(&self, reason: &str) {
        println!("error: {reason}");
    }

    fn on_data(&self, data: &[u8], _remaining: usize) {
        println!("echo: {}", String::from_utf8_lossy(data));
        self.bytes.lock().extend_from_slice(data);
    }
}

struct Echo;

impl ServerHandler for Echo {
    fn on_connected(&self, _server: &ServerHandle, client: ClientId, peer: SocketAddr) {
        println!("server: client {client} from {peer}");
    }

    fn on_data(&self, server: &ServerHandle, client: ClientId, data: &[u8]) {
        if let Err(e) = server.send(client, data) {
            println!("server: echo to {client} failed: {e}");
        }
    }
}

fn main() -> sluice::Result<()> {
    sluice::dev_tracing::init_tracing();

    let options = ReactorOptions::new()
        .with_pool_capacity(64)
        .with_queue_capacity(64)
        .with_idle(IdleStrategy::Park(Duration::from_millis(1)));

    let server = SocketServer::bind(([127, 0, 0, 1], 0).into(), &options, Arc::new(Echo))?;
    let port = server.local_addr().port();
    let reactor = Arc::new(Reactor::start(options, TcpTransport::factory));

    let handler = Arc::new(Echoed {
        bytes: Mutex::new(Vec::new()),
    });
    let client = SocketClient::new(
        Arc::clone(&reactor),
        Arc::clone(&handler) as Arc<dyn SocketHandler>,
        "127.0.0.1",
        port,
    );
    client.connect()?;
    while !client.is_connected() {
        thread::sleep(Duration::from_millis(1));
    }

    let messages = ["hello", "from", "the reactor"];
    for message in messages {
        client.send(message.as_bytes())?;
    }

    let expected: usize = messages.iter().map(|m| m.len()).sum();
    while handler.bytes.lock().len() < expected {
        thread::sleep(Duration::from_millis(1));
    }

    client.stop();
    reactor.stop();
    server.stop();
    Ok(())
}
