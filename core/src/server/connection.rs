/*
 * connection.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portiere, an asynchronous HTTP and WebSocket server.
 *
 * Portiere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portiere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portiere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Per-socket HTTP connection state machine.
//!
//! One connection type, generic over the byte stream, serves both plain TCP
//! and TLS sockets. The loop reads until the parser's is-complete predicate
//! fires, dispatches through the router, streams the response back, and
//! either re-enters the read state (keep-alive) or closes. A successful
//! WebSocket upgrade hands the stream (and any already-read bytes) to the
//! frame-mode connection.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::http::{h1, Method, Response};
use crate::protocol::http::h1::ParseError;
use crate::protocol::websocket::WebSocketConnection;
use crate::server::router::Dispatch;
use crate::server::ServerShared;

/// Socket reads and streamed file writes both move 8 KiB at a time.
const CHUNK_SIZE: usize = 8192;

pub(crate) struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    buf: BytesMut,
    shared: Arc<ServerShared>,
}

enum ReadOutcome {
    Data,
    Closed,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn new(stream: S, peer: SocketAddr, shared: Arc<ServerShared>) -> Self {
        Self {
            stream,
            peer,
            buf: BytesMut::with_capacity(CHUNK_SIZE),
            shared,
        }
    }

    /// Drive the connection to completion. All failure paths are handled
    /// internally; EOF, resets and timeouts close quietly.
    pub async fn run(mut self) {
        loop {
            // AwaitingRequest: accumulate until one full request is buffered.
            let (request, consumed) = loop {
                if h1::is_complete(&self.buf) {
                    match h1::parse_request(&self.buf) {
                        Ok(parsed) => break parsed,
                        // The predicate over-approximates for chunked bodies
                        // with trailers still in flight; keep reading.
                        Err(ParseError::NeedMore) => {}
                        Err(ParseError::TooLarge) => {
                            self.send_simple(413, "413 Payload Too Large").await;
                            return;
                        }
                        Err(_) => {
                            self.send_simple(400, "400 Bad Request").await;
                            return;
                        }
                    }
                }
                if self.buf.len() > self.shared.max_request_size {
                    self.send_simple(413, "413 Payload Too Large").await;
                    return;
                }
                match self.read_some().await {
                    ReadOutcome::Data => {}
                    ReadOutcome::Closed => return,
                }
            };

            self.buf.advance(consumed);
            let mut request = request;
            request.remote_addr = Some(self.peer);
            self.shared.stats.total_requests.fetch_add(1, Ordering::Relaxed);

            if !request.is_valid() {
                self.send_simple(400, "400 Bad Request").await;
                return;
            }
            let keep_alive = request.keep_alive();
            let is_head = request.method == Method::Head;

            let router = self.shared.router();
            match router.dispatch(&request).await {
                Ok(Dispatch::Response(mut response)) => {
                    response.set_header(
                        "Connection",
                        if keep_alive { "keep-alive" } else { "close" },
                    );
                    if !self.write_response(&response, is_head).await {
                        return;
                    }
                }
                Ok(Dispatch::Upgrade { response, factory }) => {
                    if !self.write_response(&response, false).await {
                        return;
                    }
                    self.shared.stats.total_websockets.fetch_add(1, Ordering::Relaxed);
                    self.shared.stats.active_websockets.fetch_add(1, Ordering::Relaxed);
                    let leftover = std::mem::take(&mut self.buf);
                    let mut ws = WebSocketConnection::new(self.stream, leftover, factory());
                    ws.set_max_frame_size(self.shared.ws_max_frame_size);
                    let _ = ws.run().await;
                    self.shared.stats.active_websockets.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                Err(handler_error) => {
                    tracing::debug!("[conn] handler failure: {}", handler_error);
                    let mut response = Response::new(500);
                    response.set_header("Content-Type", "text/plain; charset=utf-8");
                    response.set_header(
                        "Connection",
                        if keep_alive { "keep-alive" } else { "close" },
                    );
                    response.set_body(handler_error.to_string().into_bytes());
                    if !self.write_response(&response, is_head).await {
                        return;
                    }
                }
            }

            if !keep_alive {
                let _ = self.stream.shutdown().await;
                return;
            }
            // Keep-alive: loop back with any pipelined bytes still buffered.
        }
    }

    /// One read with the inactivity timeout armed. Timeout, EOF and peer
    /// resets all close silently.
    async fn read_some(&mut self) -> ReadOutcome {
        let mut tmp = [0u8; CHUNK_SIZE];
        match tokio::time::timeout(self.shared.keep_alive_timeout, self.stream.read(&mut tmp))
            .await
        {
            Err(_) => {
                tracing::debug!("[conn] {} idle timeout", self.peer);
                ReadOutcome::Closed
            }
            Ok(Ok(0)) => ReadOutcome::Closed,
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&tmp[..n]);
                self.shared
                    .stats
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                ReadOutcome::Data
            }
            Ok(Err(e)) => {
                if !is_quiet_disconnect(&e) {
                    tracing::debug!("[conn] {} read error: {}", self.peer, e);
                }
                ReadOutcome::Closed
            }
        }
    }

    /// Serialize headers (+ inline body) as one contiguous write, then stream
    /// a file body in chunks if present. Returns false when the connection is
    /// no longer writable.
    async fn write_response(&mut self, response: &Response, is_head: bool) -> bool {
        let head_and_body = if is_head {
            response.serialize_headers()
        } else {
            response.serialize()
        };
        if let Err(e) = self.stream.write_all(&head_and_body).await {
            if !is_quiet_disconnect(&e) {
                tracing::debug!("[conn] {} write error: {}", self.peer, e);
            }
            return false;
        }
        let mut sent = head_and_body.len() as u64;

        if !is_head {
            if let Some(stream) = &response.body_stream {
                let mut file = match tokio::fs::File::open(&stream.path).await {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::debug!(
                            "[conn] cannot reopen {}: {}",
                            stream.path.display(),
                            e
                        );
                        return false;
                    }
                };
                let mut chunk = [0u8; CHUNK_SIZE];
                loop {
                    let n = match file.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            tracing::debug!("[conn] file read error: {}", e);
                            return false;
                        }
                    };
                    if self.stream.write_all(&chunk[..n]).await.is_err() {
                        return false;
                    }
                    sent += n as u64;
                }
            }
        }

        if self.stream.flush().await.is_err() {
            return false;
        }
        self.shared.stats.bytes_sent.fetch_add(sent, Ordering::Relaxed);
        true
    }

    /// Terminal error response; the connection closes afterwards.
    async fn send_simple(&mut self, status: u16, body: &str) {
        let mut response = Response::new(status);
        response.set_header("Content-Type", "text/plain; charset=utf-8");
        response.set_header("Connection", "close");
        response.set_body(body.as_bytes().to_vec());
        let _ = self.write_response(&response, false).await;
        let _ = self.stream.shutdown().await;
    }
}

fn is_quiet_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router::{HandlerError, Router};
    use crate::server::ServerShared;
    use crate::stats::ServerStats;
    use std::sync::RwLock;
    use std::time::Duration;
    use tokio::io::duplex;

    const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

    fn shared_with(router: Router) -> Arc<ServerShared> {
        Arc::new(ServerShared {
            router: RwLock::new(Arc::new(router)),
            stats: Arc::new(ServerStats::new()),
            keep_alive_timeout: DEFAULT_KEEP_ALIVE,
            max_request_size: 1024 * 1024,
            ws_max_frame_size: 1024 * 1024,
        })
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn roundtrip(shared: Arc<ServerShared>, request: &[u8]) -> String {
        let (mut client, server) = duplex(64 * 1024);
        let conn = Connection::new(server, peer(), shared);
        let task = tokio::spawn(conn.run());

        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn serves_route_and_reports_content_length() {
        let mut router = Router::new();
        router.get("/hello", |_, resp| {
            resp.set_header("Content-Type", "text/plain");
            resp.set_body(b"Hello".to_vec());
            Ok(())
        });
        let out = roundtrip(
            shared_with(router),
            b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("Hello"));
    }

    #[tokio::test]
    async fn keep_alive_serves_two_requests_on_one_socket() {
        let mut router = Router::new();
        router.get("/a", |_, resp| {
            resp.set_body(b"first".to_vec());
            Ok(())
        });
        router.get("/b", |_, resp| {
            resp.set_body(b"second".to_vec());
            Ok(())
        });
        let shared = shared_with(router);
        let stats = shared.stats.clone();

        let (mut client, server) = duplex(64 * 1024);
        let conn = Connection::new(server, peer(), shared);
        let task = tokio::spawn(conn.run());

        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let first = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(first.contains("first"));
        assert!(first.contains("Connection: keep-alive"));

        client
            .write_all(b"GET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        let second = String::from_utf8_lossy(&rest).into_owned();
        assert!(second.contains("second"));
        assert!(second.contains("Connection: close"));

        task.await.unwrap();
        assert_eq!(stats.total_requests.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn pipelined_second_request_is_served_from_buffer() {
        let mut router = Router::new();
        router.get("/1", |_, resp| {
            resp.set_body(b"one".to_vec());
            Ok(())
        });
        router.get("/2", |_, resp| {
            resp.set_body(b"two".to_vec());
            Ok(())
        });
        let out = roundtrip(
            shared_with(router),
            b"GET /1 HTTP/1.1\r\nHost: x\r\n\r\nGET /2 HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        let one = out.find("one").unwrap();
        let two = out.find("two").unwrap();
        assert!(one < two);
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let out = roundtrip(shared_with(Router::new()), b"NONSENSE\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn oversized_buffer_gets_413() {
        let shared = Arc::new(ServerShared {
            router: RwLock::new(Arc::new(Router::new())),
            stats: Arc::new(ServerStats::new()),
            keep_alive_timeout: DEFAULT_KEEP_ALIVE,
            max_request_size: 64,
            ws_max_frame_size: 1024,
        });

        let (mut client, server) = duplex(64 * 1024);
        let conn = Connection::new(server, peer(), shared);
        let task = tokio::spawn(conn.run());

        // Headers alone exceed the 64-byte cap; no terminator yet.
        let filler = format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n", "a".repeat(200));
        client.write_all(filler.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn handler_error_maps_to_500_with_message() {
        let mut router = Router::new();
        router.get("/fail", |_, _| Err(HandlerError::from("database offline")));
        let out = roundtrip(
            shared_with(router),
            b"GET /fail HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.ends_with("database offline"));
    }

    #[tokio::test]
    async fn chunked_post_reaches_handler_reassembled() {
        let mut router = Router::new();
        router.post("/echo", |req, resp| {
            resp.set_body(req.body.clone());
            Ok(())
        });
        let out = roundtrip(
            shared_with(router),
            b"POST /echo HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
        )
        .await;
        assert!(out.contains("Content-Length: 11"));
        assert!(out.ends_with("Hello World"));
    }

    #[tokio::test]
    async fn head_omits_body() {
        let dir = std::env::temp_dir().join(format!("portiere-conn-head-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("f.txt"), "0123456789").unwrap();

        let mut router = Router::new();
        router.set_static_files(crate::server::files::StaticFiles::new(&dir));
        let out = roundtrip(
            shared_with(router),
            b"HEAD /f.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 10"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn file_body_is_streamed_after_headers() {
        let dir = std::env::temp_dir().join(format!("portiere-conn-file-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let payload = vec![b'z'; 40000];
        std::fs::write(dir.join("big.bin"), &payload).unwrap();

        let mut router = Router::new();
        router.set_static_files(crate::server::files::StaticFiles::new(&dir));
        let out = roundtrip(
            shared_with(router),
            b"GET /big.bin HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 40000"));
        let body_start = out.find("\r\n\r\n").unwrap() + 4;
        assert_eq!(out.len() - body_start, 40000);
    }

    #[tokio::test]
    async fn upgrade_hands_socket_to_websocket_loop() {
        use crate::protocol::websocket::{parse_frame, Frame, OpCode, WsHandlers, DEFAULT_MAX_FRAME_SIZE};

        let mut router = Router::new();
        router.add_websocket_route("/ws", || {
            WsHandlers::new().on_text(|text, out| {
                out.send_text(&format!("Echo: {}", text));
            })
        });
        let shared = shared_with(router);
        let stats = shared.stats.clone();

        let (mut client, server) = duplex(64 * 1024);
        let conn = Connection::new(server, peer(), shared);
        let task = tokio::spawn(conn.run());

        client
            .write_all(
                b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            )
            .await
            .unwrap();

        let mut buf = vec![0u8; 4096];
        let n = client.read(&mut buf).await.unwrap();
        let handshake = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(handshake.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(handshake.contains("Sec-Websocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        let hello = Frame::masked(OpCode::Text, b"Hi".to_vec(), [1, 2, 3, 4]).encode();
        client.write_all(&hello).await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        let (frame, _) = parse_frame(&buf[..n], DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(!frame.masked);
        assert_eq!(frame.payload, b"Echo: Hi");
        assert_eq!(stats.total_websockets.load(Ordering::Relaxed), 1);

        drop(client);
        task.await.unwrap();
        assert_eq!(stats.active_websockets.load(Ordering::Relaxed), 0);
    }
}
