//! Minimal scripted HTTP server for exercising the agent end to end.
//!
//! Each connection is handled on its own thread: the request head (and any
//! body announced by `Content-Length`) is read in full, captured, and handed
//! to the scripted handler together with the raw stream so tests can stall,
//! trickle, or hold responses open.

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::Duration,
};

/// A captured request.
#[derive(Debug, Clone)]
pub struct Request {
    pub head: String,
    pub body: Vec<u8>,
}

impl Request {
    /// The request line, e.g. `GET /path HTTP/1.1`.
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }
}

pub struct TestServer {
    addr: SocketAddr,
    requests: mpsc::Receiver<Request>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    /// Start a server that feeds every parsed request through `handler`,
    /// which writes the response directly to the stream. Connections close
    /// when the handler returns.
    pub fn spawn<F>(handler: F) -> Self
    where
        F: Fn(Request, &mut TcpStream) + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(handler);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (requests_tx, requests_rx) = mpsc::channel();

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let Ok(mut stream) = stream else { break };
                let handler = Arc::clone(&handler);
                let requests_tx = requests_tx.clone();
                thread::spawn(move || {
                    if let Some(request) = read_request(&mut stream) {
                        let _ = requests_tx.send(request.clone());
                        handler(request, &mut stream);
                    }
                });
            }
        });

        TestServer {
            addr,
            requests: requests_rx,
            shutdown,
            accept_thread: Some(accept_thread),
        }
    }

    /// Start a server that answers every request with the same canned bytes.
    pub fn static_response(response: impl Into<Vec<u8>>) -> Self {
        let response = response.into();
        Self::spawn(move |_request, stream| {
            let _ = stream.write_all(&response);
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Next captured request, waiting up to `timeout`.
    pub fn recv_request(&self, timeout: Duration) -> Option<Request> {
        self.requests.recv_timeout(timeout).ok()
    }

    /// Number of requests captured so far without waiting.
    pub fn request_count(&self) -> usize {
        self.requests.try_iter().count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

/// Format a complete response with a body and `Connection: close`.
pub fn ok_response(body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

fn read_request(stream: &mut TcpStream) -> Option<Request> {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .ok()?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut body = buf[head_end + 4..].to_vec();

    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while body.len() < content_length {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(Request { head, body })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}
