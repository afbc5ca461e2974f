/*
 * compress.rs
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

//! Gzip primitives for response compression (flate2).

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

/// Gzip-compress `data` at the given level (0–9, clamped).
pub fn compress(data: &[u8], level: u32) -> Vec<u8> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(data.len() / 2),
        Compression::new(level.min(9)),
    );
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Does the Accept-Encoding header admit gzip?
pub fn supports_gzip(accept_encoding: &str) -> bool {
    accept_encoding.split(',').any(|enc| {
        let enc = enc.trim();
        let name = enc.split(';').next().unwrap_or("").trim();
        name.eq_ignore_ascii_case("gzip") || name == "*"
    })
}

/// Content types worth compressing when no explicit list is configured.
pub fn default_compressible(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    ct.starts_with("text/")
        || ct == "application/json"
        || ct == "application/javascript"
        || ct == "application/xml"
}
