//! HTTP client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sluice_core::reactor::Reactor;
use sluice_core::request::{HttpCallback, HttpExchange, HttpRequest, HttpResponse, Payload, Record};
use sluice_core::transport::{Kind, Target};
use tracing::debug;

/// Status of responses synthesized when no request could be issued.
const UNAVAILABLE_STATUS: u16 = 500;

/// An HTTP client bound to one host.
///
/// Every request travels through the shared [`Reactor`]: the calling thread
/// only takes a record from the pool, publishes it and, for the synchronous
/// variants, waits for the reactor to complete it.
///
/// Failures never surface as `Err`. A request that could not be issued at
/// all yields status 500; a connection or protocol failure yields status 0.
/// In both cases the body describes what went wrong.
///
/// ## Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sluice::prelude::*;
/// use sluice::transport::tcp::TcpTransport;
///
/// let reactor = Arc::new(Reactor::start(ReactorOptions::default(), TcpTransport::factory));
/// let client = HttpClient::new(reactor, "api.example.com", 80, false);
/// let response = client.get("/v1/time");
/// println!("{} {}", response.status, response.text());
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    reactor: Arc<Reactor>,
    host: String,
    port: u16,
    tls: bool,
}

impl HttpClient {
    /// Create a client for `host:port`.
    pub fn new(reactor: Arc<Reactor>, host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            reactor,
            host: host.into(),
            port,
            tls,
        }
    }

    /// Create a client for `host:port`, using TLS when the port is 443.
    pub fn for_port(reactor: Arc<Reactor>, host: impl Into<String>, port: u16) -> Self {
        Self::new(reactor, host, port, port == 443)
    }

    /// Host this client talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this client talks to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether requests are sent over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Send a request and block until the response arrives.
    pub fn request(&self, request: &HttpRequest) -> HttpResponse {
        let record = match self.issue(HttpExchange::new(request.clone())) {
            Ok(record) => record,
            Err(response) => return response,
        };
        self.reactor.wait(&record);
        self.collect(record)
    }

    /// Send a request and wait at most `timeout` for the response.
    ///
    /// Returns `None` on timeout. The request keeps running on the reactor,
    /// which discards the response and recycles the record once it completes.
    pub fn request_timeout(
        &self,
        request: &HttpRequest,
        timeout: Duration,
    ) -> Option<HttpResponse> {
        let record = match self.issue(HttpExchange::new(request.clone())) {
            Ok(record) => record,
            Err(response) => return Some(response),
        };
        if !self.reactor.wait_until(&record, Instant::now() + timeout) {
            debug!(path = %request.path, "request timed out, abandoned");
            return None;
        }
        Some(self.collect(record))
    }

    /// Send a request without waiting.
    ///
    /// `callback` runs on the reactor thread when the response is complete
    /// and must not block. If the request cannot be issued it runs right
    /// away, on the calling thread, with the failure response.
    pub fn request_async<F>(&self, request: HttpRequest, callback: F)
    where
        F: FnOnce(HttpResponse) + Send + 'static,
    {
        let path = request.path.clone();
        if !self.reactor.is_enabled() {
            callback(self.unavailable(&path));
            return;
        }
        let callback: HttpCallback = Box::new(callback);
        let target = self.target(&request);
        let exchange = HttpExchange::new(request).with_callback(callback);

        let Some(record) = self.reactor.acquire(target, Payload::Http(exchange)) else {
            debug!(%path, "reactor unavailable, async request dropped");
            return;
        };
        if let Err(e) = self.reactor.submit(&record) {
            let callback = match &mut record.state().payload {
                Payload::Http(exchange) => exchange.take_callback(),
                _ => None,
            };
            self.reactor.release(record);
            if let Some(callback) = callback {
                callback(HttpResponse::failure(
                    UNAVAILABLE_STATUS,
                    format!("{path} error occurred. {e}"),
                ));
            }
        }
    }

    /// `GET path`, blocking.
    pub fn get(&self, path: &str) -> HttpResponse {
        self.request(&HttpRequest::get(path))
    }

    /// `POST path` with `body`, blocking.
    pub fn post(
        &self,
        path: &str,
        body: impl Into<bytes::Bytes>,
        content_type: &str,
    ) -> HttpResponse {
        self.request(&HttpRequest::post(path, body).with_content_type(content_type))
    }

    fn target(&self, request: &HttpRequest) -> Target {
        Target::new(Kind::Http, self.host.clone(), self.port)
            .with_tls(self.tls)
            .with_path(request.path.clone())
            .with_method(request.method.clone())
    }

    /// Acquire and submit a record, or describe why that was impossible.
    fn issue(&self, exchange: HttpExchange) -> Result<Record, HttpResponse> {
        let path = exchange.request.path.clone();
        let target = self.target(&exchange.request);
        let Some(record) = self.reactor.acquire(target, Payload::Http(exchange)) else {
            return Err(self.unavailable(&path));
        };
        if let Err(e) = self.reactor.submit(&record) {
            self.reactor.release(record);
            return Err(HttpResponse::failure(
                UNAVAILABLE_STATUS,
                format!("{path} error occurred. {e}"),
            ));
        }
        Ok(record)
    }

    fn unavailable(&self, path: &str) -> HttpResponse {
        let reason = self
            .reactor
            .disabled_reason()
            .unwrap_or("transport engine unavailable");
        HttpResponse::failure(UNAVAILABLE_STATUS, format!("{path} error occurred. {reason}"))
    }

    fn collect(&self, record: Record) -> HttpResponse {
        let response = record.take_response().unwrap_or_else(|| {
            HttpResponse::failure(UNAVAILABLE_STATUS, "response missing")
        });
        self.reactor.release(record);
        response
    }
}
