/*
 * server_integration.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the portiere server: each test binds a real listener
 * on a loopback port and drives it with raw sockets, covering routing,
 * chunked uploads, conditional static files, rate limiting, the WebSocket
 * upgrade path, and path traversal defenses.
 *
 * Run with:
 *   cargo test -p portiere_core --test server_integration
 */

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use portiere_core::config::{RateLimitConfig, ServerConfig};
use portiere_core::protocol::websocket::{
    parse_frame, Frame, OpCode, WsHandlers, DEFAULT_MAX_FRAME_SIZE,
};
use portiere_core::server::Server;
use portiere_core::Router;

/// A parsed raw response: status, headers (lowercase names), body bytes.
struct RawResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

fn parse_response(raw: &[u8]) -> RawResponse {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");
    let head = std::str::from_utf8(&raw[..split]).expect("head is not UTF-8");
    let body = raw[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    RawResponse {
        status,
        headers,
        body,
    }
}

fn loopback_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.serve_static_files = false;
    config
}

async fn start(config: ServerConfig, router: Router) -> SocketAddr {
    let server = Server::bind(config, router).await.expect("bind failed");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

/// One request on a fresh connection; the write side is closed after sending.
async fn exchange(addr: SocketAddr, request: &[u8]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

fn scratch_root(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("portiere-it-{}-{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn simple_get_serves_route_and_keeps_connection_open() {
    let mut router = Router::new();
    router.get("/hello", |_, resp| {
        resp.set_header("Content-Type", "text/plain");
        resp.set_body(b"Hello".to_vec());
        Ok(())
    });
    let addr = start(loopback_config(), router).await;

    // Two requests over the same socket verify the keep-alive loop.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    let first = parse_response(&buf[..n]);
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"Hello");
    assert_eq!(first.headers.get("content-length").unwrap(), "5");
    assert_eq!(first.headers.get("connection").unwrap(), "keep-alive");

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    let second = parse_response(&rest);
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"Hello");
}

#[tokio::test]
async fn chunked_post_is_reassembled_for_the_handler() {
    let mut router = Router::new();
    router.post("/upload", |req, resp| {
        assert_eq!(req.header("transfer-encoding"), Some("chunked"));
        resp.set_body(req.body.clone());
        Ok(())
    });
    let addr = start(loopback_config(), router).await;

    let response = exchange(
        addr,
        b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"Hello World");
}

#[tokio::test]
async fn conditional_get_returns_304_with_matching_etag() {
    let root = scratch_root("etag");
    std::fs::write(root.join("test.txt"), "Hello, ETag World!").unwrap();
    let mut config = loopback_config();
    config.serve_static_files = true;
    config.document_root = root;
    let addr = start(config, Router::new()).await;

    let first = exchange(
        addr,
        b"GET /test.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, b"Hello, ETag World!");
    let etag = first.headers.get("etag").expect("200 carries an ETag").clone();
    assert!(first.headers.contains_key("last-modified"));

    let conditional = format!(
        "GET /test.txt HTTP/1.1\r\nHost: x\r\nIf-None-Match: {}\r\nConnection: close\r\n\r\n",
        etag
    );
    let second = exchange(addr, conditional.as_bytes()).await;
    assert_eq!(second.status, 304);
    assert!(second.body.is_empty());
    assert_eq!(second.headers.get("content-length").unwrap(), "0");
    assert_eq!(second.headers.get("etag").unwrap(), &etag);
}

#[tokio::test]
async fn token_bucket_denies_fourth_request_then_recovers() {
    let mut config = loopback_config();
    config.rate_limit = Some(RateLimitConfig {
        strategy: "token_bucket".to_string(),
        max_requests: 1,
        window_duration_seconds: 1,
        burst_capacity: 3,
        key_strategy: "ip".to_string(),
        enabled: true,
    });
    let mut router = Router::new();
    router.get("/limited", |_, resp| {
        resp.set_body(b"ok".to_vec());
        Ok(())
    });
    let addr = start(config, router).await;

    let request = b"GET /limited HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
    let mut remaining = Vec::new();
    for _ in 0..3 {
        let response = exchange(addr, request).await;
        assert_eq!(response.status, 200);
        remaining.push(response.headers.get("x-ratelimit-remaining").unwrap().clone());
    }
    assert_eq!(remaining, vec!["2", "1", "0"]);

    let denied = exchange(addr, request).await;
    assert_eq!(denied.status, 429);
    assert_eq!(denied.headers.get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(denied.headers.get("x-ratelimit-type").unwrap(), "token_bucket");
    assert!(denied.headers.contains_key("x-ratelimit-reset"));
    let body: serde_json::Value = serde_json::from_slice(&denied.body).unwrap();
    assert_eq!(body["error"], "Too Many Requests");

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let recovered = exchange(addr, request).await;
    assert_eq!(recovered.status, 200);
}

#[tokio::test]
async fn websocket_echo_over_tcp() {
    let mut router = Router::new();
    router.add_websocket_route("/ws", || {
        WsHandlers::new().on_text(|text, out| {
            out.send_text(&format!("Echo: {}", text));
        })
    });
    let addr = start(loopback_config(), router).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    let handshake = parse_response(&buf[..n]);
    assert_eq!(handshake.status, 101);
    assert_eq!(
        handshake.headers.get("sec-websocket-accept").unwrap(),
        "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
    assert!(handshake
        .headers
        .get("upgrade")
        .unwrap()
        .eq_ignore_ascii_case("websocket"));

    let hello = Frame::masked(OpCode::Text, b"Hi".to_vec(), [0x37, 0xfa, 0x21, 0x3d]).encode();
    stream.write_all(&hello).await.unwrap();

    let n = stream.read(&mut buf).await.unwrap();
    let (frame, _) = parse_frame(&buf[..n], DEFAULT_MAX_FRAME_SIZE).unwrap();
    assert_eq!(frame.opcode, OpCode::Text);
    assert!(!frame.masked, "server frames are unmasked");
    assert_eq!(frame.payload, b"Echo: Hi");
}

#[tokio::test]
async fn websocket_upgrade_on_unregistered_path_is_not_101() {
    let addr = start(loopback_config(), Router::new()).await;
    let response = exchange(
        addr,
        b"GET /nows HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn path_traversal_is_refused() {
    let root = scratch_root("traversal");
    std::fs::write(root.join("index.html"), "<p>home</p>").unwrap();
    let mut config = loopback_config();
    config.serve_static_files = true;
    config.document_root = root;
    let addr = start(config, Router::new()).await;

    let response = exchange(
        addr,
        b"GET /../../../etc/passwd HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 403);
    assert!(!response.body.windows(5).any(|w| w == b"root:"));
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let server = Server::bind(loopback_config(), Router::new())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let task = tokio::spawn(server.run());

    // Server answers before shutdown.
    let response = exchange(
        addr,
        b"GET /missing HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 404);

    handle.shutdown();
    task.await.unwrap().unwrap();
    // The listener is gone; new connections are refused (or reset).
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn gzip_applies_end_to_end() {
    let mut config = loopback_config();
    config.enable_compression = true;
    let mut router = Router::new();
    let page = "lorem ipsum dolor sit amet ".repeat(200);
    let page_len = page.len();
    router.get("/page", move |_, resp| {
        resp.set_header("Content-Type", "text/html");
        resp.set_body(page.clone().into_bytes());
        Ok(())
    });
    let addr = start(config, router).await;

    let response = exchange(
        addr,
        b"GET /page HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-encoding").unwrap(), "gzip");
    assert!(response.body.len() < page_len);
    // Gzip magic bytes.
    assert_eq!(&response.body[..2], &[0x1f, 0x8b]);
}
