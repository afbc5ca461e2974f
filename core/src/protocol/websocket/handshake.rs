/*
 * handshake.rs
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

//! WebSocket opening handshake, server side (RFC 6455 §4.2): validate the
//! upgrade request, compute Sec-WebSocket-Accept, build the 101 or 400.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::protocol::http::{Request, Response};

/// Magic GUID appended to the client key (RFC 6455 §4.2.2).
const WS_ACCEPT_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// True when the request asks for a WebSocket upgrade (routing looks at this
/// before full validation).
pub fn is_upgrade_request(req: &Request) -> bool {
    req.header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Sec-WebSocket-Accept: base64(SHA-1(key_base64 ∥ magic)).
pub fn compute_accept(key_base64: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key_base64.as_bytes());
    hasher.update(WS_ACCEPT_MAGIC);
    BASE64.encode(hasher.finalize())
}

/// Validate the upgrade request. Returns the computed accept value, or the
/// reason the handshake must be rejected.
pub fn validate_upgrade(req: &Request) -> Result<String, &'static str> {
    if !is_upgrade_request(req) {
        return Err("missing Upgrade: websocket header");
    }
    let connection_has_upgrade = req
        .header("connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    if !connection_has_upgrade {
        return Err("Connection header must include Upgrade");
    }
    match req.header("sec-websocket-version") {
        Some("13") => {}
        _ => return Err("unsupported Sec-WebSocket-Version"),
    }
    let key = match req.header("sec-websocket-key") {
        Some(k) => k.trim(),
        None => return Err("missing Sec-WebSocket-Key"),
    };
    match BASE64.decode(key) {
        Ok(decoded) if decoded.len() == 16 => Ok(compute_accept(key)),
        _ => Err("Sec-WebSocket-Key is not 16 base64 bytes"),
    }
}

/// 101 Switching Protocols carrying the accept value.
pub fn accept_response(accept: &str) -> Response {
    let mut resp = Response::new(101);
    resp.remove_header("Content-Length");
    resp.set_header("Upgrade", "websocket");
    resp.set_header("Connection", "Upgrade");
    resp.set_header("Sec-WebSocket-Accept", accept);
    resp
}

/// 400 with the rejection reason in a diagnostic header.
pub fn reject_response(reason: &str) -> Response {
    let mut resp = Response::new(400);
    resp.set_header("X-WebSocket-Reject-Reason", reason);
    resp.set_body(reason.as_bytes().to_vec());
    resp
}
