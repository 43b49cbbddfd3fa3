//! In-process fake gateway shared by the integration tests
//!
//! Serves one scripted reply per accepted connection, in order, and records
//! each request it saw. Event-stream replies use chunked transfer encoding
//! with one HTTP chunk per scripted chunk.

#![allow(dead_code)]

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use chat_core::StreamingToken;

/// A request as the fake gateway received it
#[derive(Debug)]
pub struct RecordedRequest {
    pub head: String,
    pub body: String,
}

impl RecordedRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("request body is JSON")
    }
}

/// One scripted response
pub struct Reply {
    status: u16,
    content_type: &'static str,
    chunks: Vec<Vec<u8>>,
    hold: Option<oneshot::Receiver<()>>,
    truncate: bool,
}

impl Reply {
    /// A 200 event stream written as the given chunks
    pub fn events(chunks: &[&str]) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream",
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            hold: None,
            truncate: false,
        }
    }

    /// A complete (non-streaming) response
    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            chunks: vec![body.as_bytes().to_vec()],
            hold: None,
            truncate: false,
        }
    }

    /// Keep the connection open after the last chunk until `release` fires
    pub fn hold_until(mut self, release: oneshot::Receiver<()>) -> Self {
        self.hold = Some(release);
        self
    }

    /// Close the socket after the last chunk without ending the body
    pub fn truncated(mut self) -> Self {
        self.truncate = true;
        self
    }
}

/// Start a fake gateway serving `replies` in order
pub async fn serve(replies: Vec<Reply>) -> (String, mpsc::UnboundedReceiver<RecordedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();

    let _server: JoinHandle<()> = tokio::spawn(async move {
        for reply in replies {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(request) = read_request(&mut stream).await else {
                continue;
            };
            let _ = tx.send(request);
            write_reply(&mut stream, reply).await;
        }
    });

    (format!("http://{addr}"), rx)
}

/// A base URL nothing is listening on
pub async fn unused_base_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break buf.len();
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = String::from_utf8_lossy(&buf[head_end..]).into_owned();
    Ok(RecordedRequest { head, body })
}

async fn write_reply(stream: &mut TcpStream, reply: Reply) {
    let reason = match reply.status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    };

    let chunked = reply.status == 200;
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nConnection: close\r\n",
        reply.status, reason, reply.content_type
    );
    if chunked {
        head.push_str("Transfer-Encoding: chunked\r\n");
    } else {
        let len: usize = reply.chunks.iter().map(Vec::len).sum();
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("\r\n");

    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    for chunk in &reply.chunks {
        let written = if chunked {
            write_chunk(stream, chunk).await
        } else {
            stream.write_all(chunk).await
        };
        if written.is_err() || stream.flush().await.is_err() {
            return;
        }
    }
    if let Some(release) = reply.hold {
        let _ = release.await;
    }
    if chunked && !reply.truncate {
        let _ = stream.write_all(b"0\r\n\r\n").await;
    }
    let _ = stream.shutdown().await;
}

async fn write_chunk(stream: &mut TcpStream, chunk: &[u8]) -> std::io::Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    stream
        .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
        .await?;
    stream.write_all(chunk).await?;
    stream.write_all(b"\r\n").await
}

/// Receive tokens until a terminal one (or the channel closes)
pub async fn collect(rx: &mut mpsc::Receiver<StreamingToken>) -> Vec<StreamingToken> {
    let mut tokens = Vec::new();
    while let Some(token) = recv(rx).await {
        let terminal = token.is_terminal();
        tokens.push(token);
        if terminal {
            break;
        }
    }
    tokens
}

/// Receive one token, failing the test after five seconds
pub async fn recv(rx: &mut mpsc::Receiver<StreamingToken>) -> Option<StreamingToken> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a stream token")
}
