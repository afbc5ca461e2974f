/*
 * response.rs
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

//! HTTP response: status + reason table, headers with canonical casing, body or file stream.

use std::path::PathBuf;

use bytes::{BufMut, BytesMut};

use crate::protocol::http::date;

/// Identifies this server in the `Server` header.
pub const SERVER_NAME: &str = "portiere/0.1";

/// Reason phrase for a status code.
pub fn status_message(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Restartable file body: the connection streams it in chunks instead of
/// loading the file into memory. The path is reopened on each send.
#[derive(Debug, Clone)]
pub struct BodyStream {
    pub path: PathBuf,
    pub len: u64,
}

/// Response under construction by a handler or by the server itself.
///
/// Headers keep insertion order; names are matched case-insensitively and
/// written with canonical Dash-Title casing. `Server`, `Date` and
/// `Content-Length: 0` are preset on construction.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub body_stream: Option<BodyStream>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        let mut resp = Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            body_stream: None,
        };
        resp.set_header("Server", SERVER_NAME);
        resp.set_header("Date", &date::now_http_date());
        resp.set_header("Content-Length", "0");
        resp
    }

    /// Set or replace a header (name match is case-insensitive).
    pub fn set_header(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        for (k, v) in self.headers.iter_mut() {
            if *k == key {
                *v = value.to_string();
                return;
            }
        }
        self.headers.push((key, value.to_string()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let key = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove_header(&mut self, name: &str) {
        let key = name.to_ascii_lowercase();
        self.headers.retain(|(k, _)| *k != key);
    }

    /// Iterate headers in insertion order as (lowercase name, value).
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Set the inline body and update Content-Length.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        self.body_stream = None;
        let len = self.body.len().to_string();
        self.set_header("Content-Length", &len);
    }

    /// Attach a file body. The inline body is cleared; Content-Length is the file size.
    pub fn set_body_stream(&mut self, path: PathBuf, len: u64) {
        self.body.clear();
        self.set_header("Content-Length", &len.to_string());
        self.body_stream = Some(BodyStream { path, len });
    }

    /// Shorthand: status + plain-text body.
    pub fn text(status: u16, body: &str) -> Self {
        let mut resp = Response::new(status);
        resp.set_header("Content-Type", "text/plain; charset=utf-8");
        resp.set_body(body.as_bytes().to_vec());
        resp
    }

    /// Shorthand: status + JSON body.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let mut resp = Response::new(status);
        resp.set_header("Content-Type", "application/json");
        resp.set_body(value.to_string().into_bytes());
        resp
    }

    /// Serialize the status line and headers (terminated by the blank line).
    pub fn serialize_headers(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);
        out.put_slice(b"HTTP/1.1 ");
        out.put_slice(self.status.to_string().as_bytes());
        out.put_u8(b' ');
        out.put_slice(status_message(self.status).as_bytes());
        out.put_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.put_slice(canonical_case(name).as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out
    }

    /// Serialize headers and the inline body into one contiguous buffer.
    /// File-stream bodies are written separately by the connection.
    pub fn serialize(&self) -> BytesMut {
        let mut out = self.serialize_headers();
        out.put_slice(&self.body);
        out
    }
}

/// Canonical Dash-Title casing: uppercase after start and each '-', lowercase elsewhere.
pub fn canonical_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if c == '-' {
            out.push('-');
            upper = true;
        } else if upper {
            out.push(c.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(c.to_ascii_lowercase());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_casing() {
        assert_eq!(canonical_case("content-type"), "Content-Type");
        assert_eq!(canonical_case("x-rate-limit-remaining"), "X-Rate-Limit-Remaining");
        assert_eq!(canonical_case("DATE"), "Date");
        assert_eq!(canonical_case("etag"), "Etag");
    }

    #[test]
    fn defaults_on_construction() {
        let resp = Response::new(200);
        assert_eq!(resp.header("server"), Some(SERVER_NAME));
        assert_eq!(resp.header("content-length"), Some("0"));
        assert!(resp.header("date").is_some());
    }

    #[test]
    fn set_body_updates_content_length() {
        let mut resp = Response::new(200);
        resp.set_body(b"Hello".to_vec());
        assert_eq!(resp.header("Content-Length"), Some("5"));
        assert_eq!(resp.body, b"Hello");
    }

    #[test]
    fn header_replace_is_case_insensitive() {
        let mut resp = Response::new(200);
        resp.set_header("X-Test", "a");
        resp.set_header("x-test", "b");
        assert_eq!(resp.header("X-TEST"), Some("b"));
        assert_eq!(resp.headers().filter(|(k, _)| *k == "x-test").count(), 1);
    }

    #[test]
    fn serialize_has_status_line_and_terminator() {
        let mut resp = Response::new(404);
        resp.set_body(b"missing".to_vec());
        let bytes = resp.serialize();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("\r\n\r\n"));
        assert!(text.ends_with("missing"));
        assert!(text.contains("Content-Length: 7\r\n"));
    }

    #[test]
    fn body_stream_sets_length_and_clears_inline_body() {
        let mut resp = Response::new(200);
        resp.set_body(b"inline".to_vec());
        resp.set_body_stream(PathBuf::from("/tmp/f"), 4096);
        assert!(resp.body.is_empty());
        assert_eq!(resp.header("content-length"), Some("4096"));
        assert_eq!(resp.body_stream.as_ref().map(|s| s.len), Some(4096));
    }

    #[test]
    fn status_messages() {
        assert_eq!(status_message(101), "Switching Protocols");
        assert_eq!(status_message(304), "Not Modified");
        assert_eq!(status_message(429), "Too Many Requests");
        assert_eq!(status_message(999), "Unknown");
    }
}
