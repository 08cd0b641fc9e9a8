#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

pub const SAGE_HEALTH: &str = r#"{"status":"healthy","service":"SAGE RAG API","version":"1.0.0"}"#;

pub fn launcher_bin() -> &'static str {
    env!("CARGO_BIN_EXE_sage-launcher")
}

/// `sage-launcher` with a private root, cache home, and discovery settings
/// that never touch the real machine's ports.
pub fn launcher(root: &Path) -> Command {
    let mut cmd = Command::new(launcher_bin());
    cmd.arg("--root")
        .arg(root)
        .env("SAGE_HOME", root.join("home"))
        .env("SAGE_ORIGIN", "http://127.0.0.1")
        .env_remove("SAGE_BACKEND_URL")
        .env_remove("SAGE_ROOT")
        .env_remove("RUST_LOG");
    cmd
}

pub fn run(cmd: &mut Command) -> Output {
    cmd.stdin(Stdio::null()).output().unwrap()
}

fn tool_ok(program: &str, arg: &str) -> bool {
    Command::new(program)
        .arg(arg)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn python3_ok() -> bool {
    tool_ok("python3", "--version")
}

pub fn lsof_ok() -> bool {
    Command::new("lsof").arg("-v").output().is_ok()
}

pub fn can_bind_local_ports() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

pub fn pick_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

pub fn wait_for<F>(timeout: Duration, mut f: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(100));
    }
    false
}

/// Thread-per-connection HTTP server answering every request with `body`.
pub struct FakeHttp {
    pub port: u16,
}

impl FakeHttp {
    pub fn start(body: &'static str) -> Option<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").ok()?;
        let port = listener.local_addr().ok()?.port();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else {
                    continue;
                };
                thread::spawn(move || {
                    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk) {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes());
                });
            }
        });
        Some(Self { port })
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// A python process that does nothing but hold `port` open.
pub fn spawn_stale_listener(port: u16) -> Child {
    let script = format!(
        "import socket, time\n\
         s = socket.socket()\n\
         s.bind(('127.0.0.1', {port}))\n\
         s.listen()\n\
         time.sleep(120)\n"
    );
    Command::new("python3")
        .args(["-c", &script])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

/// Minimal SAGE backend: answers every GET as a healthy SAGE service.
pub const FAKE_BACKEND_PY: &str = r#"
import http.server, json, os

PORT = int(os.environ["PORT"])
BODY = json.dumps({"status": "healthy", "service": "SAGE RAG API", "version": "9.9.9"}).encode()

class Handler(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        self.send_response(200)
        self.send_header("Content-Type", "application/json")
        self.send_header("Content-Length", str(len(BODY)))
        self.end_headers()
        self.wfile.write(BODY)

    def log_message(self, *args):
        pass

print("fake backend listening", flush=True)
http.server.HTTPServer(("127.0.0.1", PORT), Handler).serve_forever()
"#;

/// Collect stdout lines of `child` on a background thread.
pub fn stdout_lines(child: &mut Child) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let stdout = child.stdout.take().unwrap();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

pub fn wait_for_line(rx: &mpsc::Receiver<String>, needle: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match rx.recv_timeout(remaining) {
            Ok(line) if line.contains(needle) => return true,
            Ok(_) => continue,
            Err(_) => return false,
        }
    }
}

pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    wait_for(timeout, || matches!(child.try_wait(), Ok(Some(_))))
}
