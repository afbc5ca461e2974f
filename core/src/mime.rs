/*
 * mime.rs
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

//! Extension → MIME type mapping for the static file service.

use std::collections::HashMap;
use std::path::Path;

/// Built-in table. Configuration can overlay additional mappings.
fn builtin(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",
        "avif" => "image/avif",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => return None,
    };
    Some(mime)
}

pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Resolve the MIME type for a path, consulting the configured overlay first.
pub fn mime_for_path(path: &Path, overlay: &HashMap<String, String>) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if let Some(m) = overlay.get(&ext) {
        return m.clone();
    }
    builtin(&ext).unwrap_or(DEFAULT_MIME).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn known_extensions() {
        let none = HashMap::new();
        assert_eq!(mime_for_path(&PathBuf::from("a/index.html"), &none), "text/html");
        assert_eq!(mime_for_path(&PathBuf::from("s.JS"), &none), "application/javascript");
        assert_eq!(mime_for_path(&PathBuf::from("pic.JPEG"), &none), "image/jpeg");
    }

    #[test]
    fn unknown_extension_is_octet_stream() {
        let none = HashMap::new();
        assert_eq!(mime_for_path(&PathBuf::from("data.xyz"), &none), DEFAULT_MIME);
        assert_eq!(mime_for_path(&PathBuf::from("no_extension"), &none), DEFAULT_MIME);
    }

    #[test]
    fn overlay_wins() {
        let mut overlay = HashMap::new();
        overlay.insert("html".to_string(), "text/x-custom".to_string());
        assert_eq!(
            mime_for_path(&PathBuf::from("index.html"), &overlay),
            "text/x-custom"
        );
    }
}
