/*
 * parser.rs
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

//! HTTP/1.1 request parser: request line, headers, body (Content-Length or chunked).
//!
//! The parser never panics; every outcome is a tagged result. It reports how
//! many bytes it consumed so the connection can splice its buffer and leave
//! the next pipelined request in place.

use std::fmt;

use crate::protocol::http::request::{
    is_valid_header_name, is_valid_header_value, parse_query, version_is_supported, Method,
    Request,
};

/// Hard cap on the decoded body size.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer does not yet hold a complete request.
    NeedMore,
    /// Request line or framing is invalid.
    Malformed,
    /// Body exceeds the 10 MiB cap.
    TooLarge,
    /// Version is neither HTTP/1.0 nor HTTP/1.1.
    InvalidVersion,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NeedMore => write!(f, "incomplete request"),
            ParseError::Malformed => write!(f, "malformed request"),
            ParseError::TooLarge => write!(f, "request body too large"),
            ParseError::InvalidVersion => write!(f, "unsupported HTTP version"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Find the header terminator: earliest CRLFCRLF (preferred) or LFLF (tolerated).
/// Returns (offset of terminator start, terminator length).
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lflf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lflf) {
        (Some(c), Some(l)) => {
            if c + 4 <= l + 2 {
                Some((c, 4))
            } else {
                Some((l, 2))
            }
        }
        (Some(c), None) => Some((c, 4)),
        (None, Some(l)) => Some((l, 2)),
        (None, None) => None,
    }
}

/// Split the header block into lines, accepting CRLF or bare LF endings.
fn header_lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    head.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
}

/// Case-insensitive substring check, for Transfer-Encoding token matching.
fn contains_token_chunked(value: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case("chunked"))
}

/// Parse one request from the front of `buf`.
///
/// On success returns the request and the number of bytes consumed, including
/// the body and (for chunked bodies) the terminating chunk and any trailers.
/// Bytes past the consumed count belong to the next request.
pub fn parse_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    parse_request_with_cap(buf, MAX_BODY_SIZE)
}

pub(crate) fn parse_request_with_cap(
    buf: &[u8],
    max_body: usize,
) -> Result<(Request, usize), ParseError> {
    let (head_end, term_len) = find_header_end(buf).ok_or(ParseError::NeedMore)?;
    let head = &buf[..head_end];
    let body_start = head_end + term_len;

    let mut lines = header_lines(head);
    let request_line = lines.next().ok_or(ParseError::Malformed)?;
    let request_line = std::str::from_utf8(request_line).map_err(|_| ParseError::Malformed)?;

    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let method_token = parts.next().ok_or(ParseError::Malformed)?;
    let target = parts.next().ok_or(ParseError::Malformed)?;
    let version = parts.next().ok_or(ParseError::Malformed)?;
    if parts.next().is_some() {
        return Err(ParseError::Malformed);
    }
    if !version_is_supported(version) {
        return Err(ParseError::InvalidVersion);
    }

    let mut request = Request::new();
    request.method = Method::from_token(method_token);
    request.version = version.to_string();
    match target.split_once('?') {
        Some((path, query)) => {
            request.path = path.to_string();
            request.query_params = parse_query(query);
        }
        None => request.path = target.to_string(),
    }
    if request.path.is_empty() {
        return Err(ParseError::Malformed);
    }

    for line in lines {
        let line = match std::str::from_utf8(line) {
            Ok(l) => l,
            Err(_) => continue, // dropped, parsing continues
        };
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let name = name.trim_matches([' ', '\t']);
        let value = value.trim_matches([' ', '\t']);
        if !is_valid_header_name(name) || !is_valid_header_value(value) {
            continue;
        }
        request.insert_header(name, value);
    }

    // Body framing. Transfer-Encoding: chunked wins over Content-Length.
    let chunked = request
        .header("transfer-encoding")
        .map(contains_token_chunked)
        .unwrap_or(false);
    let consumed = if chunked {
        let (body, body_len) = parse_chunked(&buf[body_start..], max_body)?;
        request.body = body;
        body_start + body_len
    } else if let Some(cl) = request.header("content-length") {
        let cl: usize = cl.trim().parse().map_err(|_| ParseError::Malformed)?;
        if cl > max_body {
            return Err(ParseError::TooLarge);
        }
        if buf.len() - body_start < cl {
            return Err(ParseError::NeedMore);
        }
        request.body = buf[body_start..body_start + cl].to_vec();
        body_start + cl
    } else {
        body_start
    };

    Ok((request, consumed))
}

/// Decode a chunked body. Returns (decoded body, encoded length consumed).
/// The first zero-size chunk terminates the body; trailer headers are
/// consumed and discarded.
fn parse_chunked(buf: &[u8], max_body: usize) -> Result<(Vec<u8>, usize), ParseError> {
    let mut body = Vec::new();
    let mut pos = 0usize;
    loop {
        let line_end = find_crlf(&buf[pos..]).ok_or(ParseError::NeedMore)?;
        let size_line = std::str::from_utf8(&buf[pos..pos + line_end])
            .map_err(|_| ParseError::Malformed)?;
        // Chunk extensions after ';' are ignored.
        let hex = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(hex, 16).map_err(|_| ParseError::Malformed)?;
        pos += line_end + 2;

        if size == 0 {
            // Trailer section: zero or more header lines, then a blank line.
            loop {
                let trailer_end = find_crlf(&buf[pos..]).ok_or(ParseError::NeedMore)?;
                pos += trailer_end + 2;
                if trailer_end == 0 {
                    return Ok((body, pos));
                }
            }
        }

        if body.len() + size > max_body {
            return Err(ParseError::TooLarge);
        }
        if buf.len() < pos + size + 2 {
            return Err(ParseError::NeedMore);
        }
        body.extend_from_slice(&buf[pos..pos + size]);
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ParseError::Malformed);
        }
        pos += size + 2;
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Light-weight scan of the header block for one header value (case-insensitive name).
fn scan_header<'a>(head: &'a [u8], name: &str) -> Option<&'a str> {
    for line in header_lines(head).skip(1) {
        let line = match std::str::from_utf8(line) {
            Ok(l) => l,
            Err(_) => continue,
        };
        if let Some((n, v)) = line.split_once(':') {
            if n.trim_matches([' ', '\t']).eq_ignore_ascii_case(name) {
                return Some(v.trim_matches([' ', '\t']));
            }
        }
    }
    None
}

/// Is-complete predicate used by the connection to decide when to stop reading:
/// the header terminator has been seen, and either the chunked terminator is
/// present or at least Content-Length body bytes have arrived.
pub fn is_complete(buf: &[u8]) -> bool {
    let (head_end, term_len) = match find_header_end(buf) {
        Some(x) => x,
        None => return false,
    };
    let head = &buf[..head_end];
    let body_start = head_end + term_len;

    if let Some(te) = scan_header(head, "transfer-encoding") {
        if contains_token_chunked(te) {
            return parse_chunked(&buf[body_start..], MAX_BODY_SIZE).is_ok()
                || buf.windows(7).any(|w| w == b"\r\n0\r\n\r\n");
        }
    }
    if let Some(cl) = scan_header(head, "content-length") {
        match cl.trim().parse::<usize>() {
            Ok(cl) => return buf.len() - body_start >= cl,
            Err(_) => return true, // malformed length surfaces as a parse error
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_get() {
        let raw = b"GET /hello?x=1&y=2 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/hello");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.query_params.get("x").map(String::as_str), Some("1"));
        assert_eq!(req.query_params.get("y").map(String::as_str), Some("2"));
        assert_eq!(req.header("host"), Some("example.com"));
        assert!(req.body.is_empty());
        assert!(req.is_valid());
    }

    #[test]
    fn lf_only_terminator_tolerated() {
        let raw = b"GET / HTTP/1.1\nHost: x\n\n";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.header("host"), Some("x"));
    }

    #[test]
    fn incomplete_headers_need_more() {
        assert_eq!(parse_request(b"GET / HTTP/1.1\r\nHost:"), Err(ParseError::NeedMore));
        assert!(!is_complete(b"GET / HTTP/1.1\r\nHost:"));
    }

    #[test]
    fn unknown_method_still_parses() {
        let raw = b"BREW /pot HTTP/1.1\r\n\r\n";
        let (req, _) = parse_request(raw).unwrap();
        assert_eq!(req.method, Method::Unknown);
        assert!(!req.is_valid());
    }

    #[test]
    fn bad_version_is_rejected() {
        let raw = b"GET / HTTP/2.0\r\n\r\n";
        assert_eq!(parse_request(raw), Err(ParseError::InvalidVersion));
        let raw = b"GET / FTP/1.0\r\n\r\n";
        assert_eq!(parse_request(raw), Err(ParseError::InvalidVersion));
    }

    #[test]
    fn bad_request_line_is_malformed() {
        assert_eq!(parse_request(b"GET /\r\n\r\n"), Err(ParseError::Malformed));
        assert_eq!(
            parse_request(b"GET / HTTP/1.1 extra\r\n\r\n"),
            Err(ParseError::Malformed)
        );
    }

    #[test]
    fn invalid_header_dropped_request_survives() {
        let raw = b"GET / HTTP/1.1\r\nGood: yes\r\nBad Header: no\r\nAlso: ok\r\n\r\n";
        let (req, _) = parse_request(raw).unwrap();
        assert_eq!(req.header("good"), Some("yes"));
        assert_eq!(req.header("also"), Some("ok"));
        assert_eq!(req.header("bad header"), None);
        assert!(req.is_valid());
    }

    #[test]
    fn content_length_body() {
        let raw = b"POST /submit HTTP/1.1\r\nContent-Length: 11\r\n\r\nHello World";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.body, b"Hello World");
    }

    #[test]
    fn partial_body_needs_more() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nHello";
        assert_eq!(parse_request(raw), Err(ParseError::NeedMore));
        assert!(!is_complete(raw));
    }

    #[test]
    fn chunked_body_reassembled() {
        let raw =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(req.body, b"Hello World");
        assert!(is_complete(raw));
    }

    #[test]
    fn chunk_extensions_ignored() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nHello\r\n0\r\n\r\n";
        let (req, _) = parse_request(raw).unwrap();
        assert_eq!(req.body, b"Hello");
    }

    #[test]
    fn chunked_stops_at_terminator() {
        // Bytes after the zero-size chunk belong to the next request.
        let mut raw: Vec<u8> =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nHi\r\n0\r\n\r\n".to_vec();
        let boundary = raw.len();
        raw.extend_from_slice(b"GET /next HTTP/1.1\r\n\r\n");
        let (req, consumed) = parse_request(&raw).unwrap();
        assert_eq!(req.body, b"Hi");
        assert_eq!(consumed, boundary);
        let (next, _) = parse_request(&raw[consumed..]).unwrap();
        assert_eq!(next.path, "/next");
    }

    #[test]
    fn chunked_trailers_consumed_not_exposed() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Check: 1\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(req.body, b"abc");
        assert_eq!(consumed, raw.len());
        assert_eq!(req.header("x-check"), None);
    }

    #[test]
    fn transfer_encoding_beats_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 9999\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n";
        let (req, consumed) = parse_request(raw).unwrap();
        assert_eq!(req.body, b"ok");
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn body_cap_enforced() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 100\r\n\r\n";
        assert_eq!(parse_request_with_cap(raw, 50), Err(ParseError::TooLarge));

        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n40\r\n0123456789012345678901234567890123456789012345678901234567890123\r\n0\r\n\r\n";
        assert_eq!(parse_request_with_cap(raw, 50), Err(ParseError::TooLarge));
    }

    #[test]
    fn bad_chunk_size_is_malformed() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\nHello\r\n0\r\n\r\n";
        assert_eq!(parse_request(raw), Err(ParseError::Malformed));
    }

    #[test]
    fn is_complete_content_length() {
        assert!(!is_complete(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nHel"));
        assert!(is_complete(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nHello"));
        assert!(is_complete(b"GET / HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn header_round_trip_under_case_folding() {
        // Structural property: re-parsing a serialized request preserves
        // method, path, query, headers (case-folded) and body.
        let raw = b"POST /p?k=v HTTP/1.1\r\nHost: h\r\nX-Multi: a\r\nx-multi: b\r\nContent-Length: 3\r\n\r\nxyz";
        let (req, _) = parse_request(raw).unwrap();
        let rebuilt = format!(
            "{} {}?k=v {}\r\nhost: {}\r\nx-multi: {}\r\ncontent-length: 3\r\n\r\nxyz",
            req.method.as_str(),
            req.path,
            req.version,
            req.header("HOST").unwrap(),
            req.header("X-MULTI").unwrap(),
        );
        let (req2, _) = parse_request(rebuilt.as_bytes()).unwrap();
        assert_eq!(req2.method, req.method);
        assert_eq!(req2.path, req.path);
        assert_eq!(req2.query_params, req.query_params);
        assert_eq!(req2.header("x-multi"), Some("a, b"));
        assert_eq!(req2.body, req.body);
    }
}
