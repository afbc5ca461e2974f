/*
 * request.rs
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

//! Parsed HTTP/1.1 request: method, raw target, headers (lowercase keys), query map, body.

use std::collections::HashMap;
use std::net::SocketAddr;

use percent_encoding::percent_decode_str;

/// HTTP request method. Anything outside the fixed table parses as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Unknown,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Unknown => "UNKNOWN",
        }
    }

    /// Map a request-line token to a method. Comparison is exact (methods are case-sensitive).
    pub fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }
}

/// One parsed HTTP/1.1 request.
///
/// The path is kept exactly as received (no percent-decoding) so that path
/// validation in the static file layer sees what the client sent. Header keys
/// are stored lowercase; lookup via `header()` is case-insensitive.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub query_params: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Peer address, filled in by the connection before dispatch.
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::Unknown,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: Vec::new(),
            remote_addr: None,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// Insert a header, folding duplicates with ", ". The name is lowercased;
    /// callers must have validated name and value already (the parser does).
    pub fn insert_header(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        match self.headers.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.headers.insert(key, value.to_string());
            }
        }
    }

    /// True iff the method is known, the path is non-empty and the version is
    /// HTTP/1.0 or HTTP/1.1.
    pub fn is_valid(&self) -> bool {
        self.method != Method::Unknown
            && !self.path.is_empty()
            && version_is_supported(&self.version)
    }

    /// Keep-alive decision: explicit `Connection: keep-alive`, or HTTP/1.1
    /// default in the absence of `Connection: close`.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) => {
                let v = v.to_ascii_lowercase();
                if v.split(',').any(|t| t.trim() == "close") {
                    false
                } else if v.split(',').any(|t| t.trim() == "keep-alive") {
                    true
                } else {
                    self.version == "HTTP/1.1"
                }
            }
            None => self.version == "HTTP/1.1",
        }
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// Only HTTP/1.0 and HTTP/1.1 are accepted.
pub fn version_is_supported(version: &str) -> bool {
    version == "HTTP/1.0" || version == "HTTP/1.1"
}

/// RFC 7230 token grammar: visible ASCII minus separators and CTLs.
pub fn is_valid_header_name(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            matches!(b,
                b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
                b'^' | b'_' | b'`' | b'|' | b'~' |
                b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
        })
}

/// Header values must not contain CR, LF, NUL or other C0 controls except HTAB.
pub fn is_valid_header_value(value: &str) -> bool {
    value.bytes().all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}

/// Parse the raw query string (after '?') by splitting on '&' and the first '='.
/// Percent-encodings are preserved; use `decode_component` if decoded values are needed.
pub fn parse_query(raw: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((k, v)) => params.insert(k.to_string(), v.to_string()),
            None => params.insert(pair.to_string(), String::new()),
        };
    }
    params
}

/// Percent-decode a path or query component. Handlers call this when they
/// need decoded values; the request itself stores raw bytes.
pub fn decode_component(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}
