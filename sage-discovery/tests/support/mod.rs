#![allow(dead_code)]

use std::collections::HashMap;
use std::net::TcpListener as StdListener;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const SAGE_HEALTH: &str = r#"{"status":"healthy","service":"SAGE RAG API","version":"1.0.0"}"#;

pub type Responder = Arc<dyn Fn(&str, &str) -> (u16, String) + Send + Sync>;

/// Minimal HTTP/1.1 server: one request per connection, JSON bodies only.
pub struct FakeBackend {
    pub port: u16,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start<F>(responder: F) -> Option<Self>
    where
        F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        Self::start_on(0, responder).await
    }

    pub async fn start_on<F>(port: u16, responder: F) -> Option<Self>
    where
        F: Fn(&str, &str) -> (u16, String) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.ok()?;
        let port = listener.local_addr().ok()?.port();
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let responder: Responder = Arc::new(responder);

        let task_hits = hits.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let responder = responder.clone();
                let hits = task_hits.clone();
                tokio::spawn(async move {
                    let Some((method, path)) = read_request(&mut stream).await else {
                        return;
                    };
                    *hits.lock().entry(path.clone()).or_insert(0) += 1;
                    let (status, body) = responder(&method, &path);
                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Some(Self { port, hits, task })
    }

    /// Answers `/health` as SAGE and echoes the request line elsewhere.
    pub async fn sage() -> Option<Self> {
        Self::sage_on(0).await
    }

    pub async fn sage_on(port: u16) -> Option<Self> {
        Self::start_on(port, sage_echo).await
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().values().sum()
    }

    /// Stop accepting. The port refuses connections afterwards.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn sage_echo(method: &str, path: &str) -> (u16, String) {
    if path == "/health" {
        (200, SAGE_HEALTH.to_string())
    } else {
        (200, format!(r#"{{"method":"{method}","path":"{path}"}}"#))
    }
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<(String, String)> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .ok()?
            .ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    let path = target.split('?').next().unwrap_or(target).to_string();
    Some((method, path))
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = StdListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub fn can_bind_local_ports() -> bool {
    StdListener::bind("127.0.0.1:0").is_ok()
}
