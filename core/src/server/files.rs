/*
 * files.rs
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

//! Static file service: containment inside the document root, index files,
//! strong ETags, and `If-None-Match` conditional responses.
//!
//! Directory listings are never produced; a directory without an index file
//! is a 403, and any path that canonicalizes outside the root is a 403.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::config::ServerConfig;
use crate::mime::mime_for_path;
use crate::protocol::http::{date, Method, Request, Response};

/// Static file settings snapshot taken from the configuration.
pub struct StaticFiles {
    root: PathBuf,
    index_files: Vec<String>,
    mime_overlay: HashMap<String, String>,
}

impl StaticFiles {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            root: config.document_root.clone(),
            index_files: config.index_files.clone(),
            mime_overlay: config.mime_types.clone(),
        }
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            index_files: vec!["index.html".to_string(), "index.htm".to_string()],
            mime_overlay: HashMap::new(),
        }
    }

    /// Try to answer `req` from the document root, writing into `response`.
    /// Returns false when nothing matched (the router then answers 404);
    /// containment violations and index-less directories produce 403 here.
    pub async fn respond(&self, req: &Request, response: &mut Response) -> bool {
        let root = match tokio::fs::canonicalize(&self.root).await {
            Ok(r) => r,
            Err(_) => return false, // no document root, nothing to serve
        };

        let relative = req.path.trim_start_matches('/');
        let candidate = root.join(relative);
        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(p) => p,
            Err(_) => return false,
        };
        if !resolved.starts_with(&root) {
            tracing::warn!("[files] path escapes document root: {}", req.path);
            forbidden(response);
            return true;
        }

        let meta = match tokio::fs::metadata(&resolved).await {
            Ok(m) => m,
            Err(_) => return false,
        };

        let file_path = if meta.is_dir() {
            match self.find_index(&resolved).await {
                Some(p) => p,
                None => {
                    forbidden(response);
                    return true;
                }
            }
        } else if meta.is_file() {
            resolved
        } else {
            return false;
        };

        self.serve_file(&file_path, req, response).await
    }

    async fn find_index(&self, dir: &Path) -> Option<PathBuf> {
        for name in &self.index_files {
            let candidate = dir.join(name);
            if let Ok(meta) = tokio::fs::metadata(&candidate).await {
                if meta.is_file() {
                    return Some(candidate);
                }
            }
        }
        None
    }

    async fn serve_file(&self, path: &Path, req: &Request, response: &mut Response) -> bool {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return false,
        };
        let len = meta.len();
        let modified = meta.modified().ok();
        let etag = file_etag(path, len, modified);
        let last_modified = modified.map(date::format_http_date);

        response.set_header("Etag", &etag);
        if let Some(lm) = &last_modified {
            response.set_header("Last-Modified", lm);
        }

        // If-Modified-Since is parsed and available, but on its own it does
        // not produce a 304 (see parse_http_date); only If-None-Match does.
        let _if_modified_since = req.header("if-modified-since").and_then(date::parse_http_date);

        if let Some(inm) = req.header("if-none-match") {
            if etag_matches(inm, &etag) {
                response.status = 304;
                response.set_body(Vec::new());
                return true;
            }
        }

        response.status = 200;
        response.set_header("Content-Type", &mime_for_path(path, &self.mime_overlay));
        response.set_header("Cache-Control", "public, max-age=3600");
        if req.method == Method::Head {
            response.set_body(Vec::new());
            response.set_header("Content-Length", &len.to_string());
        } else {
            response.set_body_stream(path.to_path_buf(), len);
        }
        true
    }
}

fn forbidden(response: &mut Response) {
    response.status = 403;
    response.set_header("Content-Type", "text/plain; charset=utf-8");
    response.set_body(b"403 Forbidden".to_vec());
}

/// Strong ETag: FNV-1a 64 over path ∥ size ∥ mtime ticks, quoted lowercase hex.
pub fn file_etag(path: &Path, len: u64, modified: Option<std::time::SystemTime>) -> String {
    let ticks = modified
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hash = fnv1a64(path.to_string_lossy().as_bytes());
    hash = fnv1a64_continue(hash, &len.to_le_bytes());
    hash = fnv1a64_continue(hash, &ticks.to_le_bytes());
    format!("\"{:016x}\"", hash)
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(data: &[u8]) -> u64 {
    fnv1a64_continue(FNV_OFFSET, data)
}

fn fnv1a64_continue(mut hash: u64, data: &[u8]) -> u64 {
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `If-None-Match` matching: `*` matches anything; otherwise split on ',',
/// trim, strip a `W/` prefix on both sides, strip quotes, compare equal.
pub fn etag_matches(header: &str, etag: &str) -> bool {
    if header.trim() == "*" {
        return true;
    }
    let ours = strip_etag(etag);
    header.split(',').any(|candidate| strip_etag(candidate) == ours)
}

fn strip_etag(raw: &str) -> &str {
    let raw = raw.trim();
    let raw = raw.strip_prefix("W/").unwrap_or(raw);
    raw.trim_matches('"')
}
