//! HTTP requests against the scripted engine.
//!
//! Shows the three ways of issuing a request (blocking, with a deadline and
//! with a callback) and the lifecycle events the reactor reports, without
//! touching the network.
//!
//! Run with: `cargo run --example scripted_http`

use std::sync::Arc;
use std::time::Duration;

use sluice::prelude::*;
use sluice::transport::scripted::{Script, ScriptedResponse, ScriptedTransport};
use sluice::transport::Transport;

fn main() {
    sluice::dev_tracing::init_tracing();

    let (engine, script) = ScriptedTransport::new();
    script.set_default(Script::respond(
        ScriptedResponse::new(200, "{\"price\":101.5}").with_content_type("application/json"),
    ));

    let options = ReactorOptions::new()
        .with_pool_capacity(16)
        .with_queue_capacity(16)
        .with_wait(WaitStrategy::Park);
    let reactor = Arc::new(Reactor::start(options, move |_| {
        Ok(Box::new(engine) as Box<dyn Transport>)
    }));
    let events = reactor.monitor();
    let client = HttpClient::for_port(Arc::clone(&reactor), "quotes.example", 443);

    let response = client.get("/v1/quote/ACME");
    println!("sync:     {} {}", response.status, response.text());

    script.push(Script::fail("connection reset"));
    let response = client.get("/v1/quote/FAIL");
    println!("failed:   {} {}", response.status, response.text());

    script.hold_writable(true);
    let slow = HttpRequest::post("/v1/orders", "qty=1");
    match client.request_timeout(&slow, Duration::from_millis(10)) {
        Some(response) => println!("deadline: {}", response.status),
        None => println!("deadline: timed out"),
    }
    script.hold_writable(false);

    let (tx, rx) = flume::bounded(1);
    client.request_async(HttpRequest::get("/v1/quote/ASYNC"), move |response| {
        let _ = tx.send(response);
    });
    if let Ok(response) = rx.recv_timeout(Duration::from_secs(1)) {
        println!("async:    {} {}", response.status, response.text());
    }

    reactor.stop();
    for event in events.try_iter() {
        println!("event:    {event}");
    }
}
