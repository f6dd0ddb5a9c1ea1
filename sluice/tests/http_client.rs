//! HttpClient against the scripted engine

use std::sync::Arc;
use std::time::Duration;

use sluice::prelude::*;
use sluice::transport::scripted::{Script, ScriptHandle, ScriptedResponse, ScriptedTransport};
use sluice::transport::Transport;

fn client(tls: bool) -> (HttpClient, ScriptHandle) {
    sluice::dev_tracing::init_test_tracing();
    let (engine, handle) = ScriptedTransport::new();
    let options = ReactorOptions::new()
        .with_pool_capacity(16)
        .with_queue_capacity(16)
        .with_wait(WaitStrategy::Park);
    let reactor = Reactor::start(options, move |_| Ok(Box::new(engine) as Box<dyn Transport>));
    let port = if tls { 443 } else { 80 };
    (HttpClient::for_port(Arc::new(reactor), "api.test", port), handle)
}

#[test]
fn test_get_returns_scripted_response() {
    let (client, handle) = client(true);
    handle.set_default(Script::respond(
        ScriptedResponse::new(200, "pong").with_content_type("text/plain"),
    ));

    let response = client.get("/ping");
    assert!(response.is_success());
    assert_eq!(response.text(), "pong");
    assert_eq!(response.content_type.as_deref(), Some("text/plain"));

    let (_, target) = &handle.connects()[0];
    assert!(target.tls);
    assert_eq!(target.method, "GET");
    assert_eq!(target.to_string(), "https://api.test:443/ping");
}

#[test]
fn test_post_sends_body_and_headers() {
    let (client, handle) = client(false);
    assert!(!client.is_tls());

    let response = client.post("/orders", "{\"qty\":1}", "application/json");
    assert_eq!(response.status, 200);

    let token = handle.last_token().unwrap();
    let headers = handle.headers(token);
    assert!(headers.contains(&("Content-Type".to_string(), "application/json".to_string())));
    assert!(headers.contains(&("Content-Length".to_string(), "9".to_string())));
    assert_eq!(handle.sent()[0].data, b"{\"qty\":1}");
    assert_eq!(handle.connects()[0].1.method, "POST");
}

#[test]
fn test_connection_failure_is_a_response() {
    let (client, handle) = client(false);
    handle.set_default(Script::fail("tls handshake failed"));

    let response = client.get("/secure");
    assert_eq!(response.status, 0);
    assert_eq!(response.text(), "/secure error occurred. tls handshake failed");
}

#[test]
fn test_sequential_requests_reuse_records() {
    let (client, handle) = client(false);
    for i in 0..50 {
        let response = client.request(&HttpRequest::get(format!("/n/{i}")));
        assert_eq!(response.status, 200, "request {i}");
    }
    let tokens: Vec<u64> = handle.connects().iter().map(|(t, _)| *t).collect();
    assert_eq!(tokens.len(), 50);
    assert!(tokens.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_concurrent_callers() {
    let (client, _handle) = client(false);
    let client = Arc::new(client);

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let client = Arc::clone(&client);
            std::thread::spawn(move || {
                for i in 0..25 {
                    let response = client.get(&format!("/w/{w}/{i}"));
                    assert!(response.is_success());
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

#[test]
fn test_request_timeout() {
    let (client, handle) = client(false);
    handle.hold_writable(true);

    let request = HttpRequest::post("/slow", "x");
    assert!(client.request_timeout(&request, Duration::from_millis(20)).is_none());

    handle.hold_writable(false);
    let response = client.request_timeout(&HttpRequest::get("/fast"), Duration::from_secs(5));
    assert_eq!(response.map(|r| r.status), Some(200));
}

#[test]
fn test_request_async() {
    let (client, handle) = client(false);
    handle.set_default(Script::respond(ScriptedResponse::new(202, "queued")));

    let (tx, rx) = flume::unbounded();
    for i in 0..3 {
        let tx = tx.clone();
        client.request_async(HttpRequest::get(format!("/jobs/{i}")), move |response| {
            let _ = tx.send(response);
        });
    }
    for _ in 0..3 {
        let response = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(response.text(), "queued");
    }
}

#[test]
fn test_disabled_reactor_yields_500() {
    let reactor = Reactor::start(ReactorOptions::default(), |_| {
        Err(SluiceError::EngineUnavailable("failed to create engine context".into()))
    });
    let client = HttpClient::new(Arc::new(reactor), "api.test", 80, false);

    let response = client.get("/x");
    assert_eq!(response.status, 500);
    assert!(response.text().starts_with("/x error occurred. "));
    assert!(response.text().contains("failed to create engine context"));

    let (tx, rx) = flume::bounded(1);
    client.request_async(HttpRequest::get("/y"), move |response| {
        let _ = tx.send(response.status);
    });
    assert_eq!(rx.try_recv(), Ok(500));
}

#[test]
fn test_stopped_reactor_yields_500() {
    let (engine, _handle) = ScriptedTransport::new();
    let reactor = Arc::new(Reactor::start(
        ReactorOptions::new().with_pool_capacity(4),
        move |_| Ok(Box::new(engine) as Box<dyn Transport>),
    ));
    let client = HttpClient::new(Arc::clone(&reactor), "api.test", 80, false);
    reactor.stop();

    let response = client.get("/late");
    assert_eq!(response.status, 500);
    assert_eq!(response.text(), "/late error occurred. Reactor shutting down");
}
