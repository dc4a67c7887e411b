//! In-process stand-in for the control API, bound to a random local port.
//!
//! Routes are keyed by method and path (query string ignored). Each route holds a
//! queue of canned responses; the last one is repeated once the queue drains.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::retrieve::ApiConfig;

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl MockResponse {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self { status, body: body.into(), delay: Duration::ZERO }
    }

    pub fn empty(status: u16) -> Self {
        Self::json(status, "")
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    /// Path plus query, as sent.
    pub target: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

type Routes = Arc<Mutex<HashMap<(String, String), VecDeque<MockResponse>>>>;

pub struct MockControlApi {
    addr: SocketAddr,
    routes: Routes,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown: CancellationToken,
}

impl MockControlApi {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind to random port");
        let addr = listener.local_addr().expect("No local address");
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let (r, q, token) = (Arc::clone(&routes), Arc::clone(&requests), shutdown.clone());
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let (r, q) = (Arc::clone(&r), Arc::clone(&q));
                        tokio::spawn(async move {
                            let _ = serve(stream, r, q).await;
                        });
                    }
                }
            }
        });

        Self { addr, routes, requests, shutdown }
    }

    /// Queues `response` for `method path`.
    pub fn route(&self, method: &str, path: &str, response: MockResponse) {
        self.routes
            .lock()
            .unwrap()
            .entry((method.to_string(), path.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Drops whatever is queued for `method path` and serves `response` from now on.
    pub fn replace(&self, method: &str, path: &str, response: MockResponse) {
        self.routes
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), VecDeque::from([response]));
    }

    pub fn config(&self, secret: Option<&str>) -> ApiConfig {
        ApiConfig::new(format!("http://{}", self.addr), secret.map(str::to_string))
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

impl Drop for MockControlApi {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(mut stream: TcpStream, routes: Routes, requests: Arc<Mutex<Vec<RecordedRequest>>>) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 2048];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let path = target.split('?').next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buf[header_end..body_end]).to_string();

    requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        target,
        path: path.clone(),
        headers,
        body,
    });

    let response = {
        let mut routes = routes.lock().unwrap();
        match routes.get_mut(&(method, path)) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
    }
    .unwrap_or_else(|| MockResponse::json(404, r#"{"message":"no route"}"#));

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let reason = match response.status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        408 => "Request Timeout",
        _ => "Status",
    };
    let raw = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        reason,
        response.body.len(),
        response.body
    );
    stream.write_all(raw.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}
