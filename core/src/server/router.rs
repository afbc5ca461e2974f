/*
 * router.rs
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

//! Routing and the middleware pipeline.
//!
//! One `Response` travels through the whole dispatch: middleware may mutate
//! it (and stop the pipeline), the matched handler fills it in, the static
//! file service writes into it, and the post-dispatch step may gzip it.
//! Route patterns are either literal or a literal prefix ending in '*'.

use std::fmt;
use std::sync::Arc;

use crate::compress;
use crate::config::ServerConfig;
use crate::protocol::http::{Method, Request, Response};
use crate::protocol::websocket::{
    accept_response, is_upgrade_request, reject_response, validate_upgrade, WsHandlers,
};
use crate::server::files::StaticFiles;

/// Failure reported by a handler; the connection maps it to a 500.
#[derive(Debug)]
pub struct HandlerError(pub String);

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError(s)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError(e.to_string())
    }
}

pub type Handler =
    Arc<dyn Fn(&Request, &mut Response) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareAction {
    Continue,
    Stop,
}

pub type Middleware = Arc<dyn Fn(&Request, &mut Response) -> MiddlewareAction + Send + Sync>;

/// Builds the per-connection handler record for an upgraded WebSocket.
pub type WsFactory = Arc<dyn Fn() -> WsHandlers + Send + Sync>;

struct Route {
    pattern: String,
    method: Method,
    handler: Handler,
}

/// Outcome of a dispatch: a finished response, or a 101 plus the WebSocket
/// factory for the connection to hand the socket over.
pub enum Dispatch {
    Response(Response),
    Upgrade { response: Response, factory: WsFactory },
}

/// Gzip settings applied post-dispatch.
#[derive(Debug, Clone)]
pub struct CompressionSettings {
    pub enabled: bool,
    pub min_size: usize,
    pub level: u32,
    /// Content-type prefixes; empty means the built-in set.
    pub types: Vec<String>,
}

impl CompressionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            enabled: config.enable_compression,
            min_size: config.compression_min_size,
            level: config.compression_level,
            types: config.compressible_types.clone(),
        }
    }

    fn compressible(&self, content_type: &str) -> bool {
        if self.types.is_empty() {
            compress::default_compressible(content_type)
        } else {
            self.types.iter().any(|p| content_type.starts_with(p.as_str()))
        }
    }
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 1024,
            level: 6,
            types: Vec::new(),
        }
    }
}

pub struct Router {
    routes: Vec<Route>,
    ws_routes: Vec<(String, WsFactory)>,
    middleware: Vec<Middleware>,
    static_files: Option<StaticFiles>,
    compression: CompressionSettings,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            ws_routes: Vec::new(),
            middleware: Vec::new(),
            static_files: None,
            compression: CompressionSettings::default(),
        }
    }

    /// Register a handler for (pattern, method). A trailing '*' makes the
    /// pattern a prefix match; otherwise the match is exact.
    pub fn add_route(
        &mut self,
        pattern: impl Into<String>,
        method: Method,
        handler: impl Fn(&Request, &mut Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.routes.push(Route {
            pattern: pattern.into(),
            method,
            handler: Arc::new(handler),
        });
    }

    pub fn get(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request, &mut Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.add_route(pattern, Method::Get, handler);
    }

    pub fn post(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request, &mut Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.add_route(pattern, Method::Post, handler);
    }

    pub fn put(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request, &mut Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.add_route(pattern, Method::Put, handler);
    }

    pub fn delete(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request, &mut Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.add_route(pattern, Method::Delete, handler);
    }

    pub fn head(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request, &mut Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.add_route(pattern, Method::Head, handler);
    }

    pub fn options(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request, &mut Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.add_route(pattern, Method::Options, handler);
    }

    pub fn patch(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Fn(&Request, &mut Response) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) {
        self.add_route(pattern, Method::Patch, handler);
    }

    /// Register a WebSocket endpoint. The factory runs once per accepted
    /// upgrade and returns that connection's handlers.
    pub fn add_websocket_route(
        &mut self,
        path: impl Into<String>,
        factory: impl Fn() -> WsHandlers + Send + Sync + 'static,
    ) {
        self.ws_routes.push((path.into(), Arc::new(factory)));
    }

    /// Append to the middleware chain; execution order is registration order.
    pub fn add_middleware(
        &mut self,
        mw: impl Fn(&Request, &mut Response) -> MiddlewareAction + Send + Sync + 'static,
    ) {
        self.middleware.push(Arc::new(mw));
    }

    /// Put a middleware ahead of everything registered so far. The server
    /// uses this for the configured rate limiter so it gates the pipeline.
    pub fn prepend_middleware(&mut self, mw: Middleware) {
        self.middleware.insert(0, mw);
    }

    pub fn set_static_files(&mut self, files: StaticFiles) {
        self.static_files = Some(files);
    }

    pub fn set_compression(&mut self, settings: CompressionSettings) {
        self.compression = settings;
    }

    fn ws_route(&self, path: &str) -> Option<WsFactory> {
        self.ws_routes
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, f)| f.clone())
    }

    /// Exact match first, then prefix patterns in registration order.
    fn find_route(&self, path: &str, method: Method) -> Option<Handler> {
        for route in &self.routes {
            if route.method == method && !route.pattern.ends_with('*') && route.pattern == path {
                return Some(route.handler.clone());
            }
        }
        for route in &self.routes {
            if route.method != method {
                continue;
            }
            if let Some(prefix) = route.pattern.strip_suffix('*') {
                if path.starts_with(prefix) {
                    return Some(route.handler.clone());
                }
            }
        }
        None
    }

    /// Run the pipeline for one request.
    pub async fn dispatch(&self, req: &Request) -> Result<Dispatch, HandlerError> {
        let mut response = Response::new(200);

        for mw in &self.middleware {
            if mw(req, &mut response) == MiddlewareAction::Stop {
                self.apply_compression(req, &mut response);
                return Ok(Dispatch::Response(response));
            }
        }

        if is_upgrade_request(req) {
            if let Some(factory) = self.ws_route(&req.path) {
                return match validate_upgrade(req) {
                    Ok(accept) => Ok(Dispatch::Upgrade {
                        response: accept_response(&accept),
                        factory,
                    }),
                    Err(reason) => {
                        tracing::debug!("[router] websocket upgrade rejected: {}", reason);
                        Ok(Dispatch::Response(reject_response(reason)))
                    }
                };
            }
        }

        if let Some(handler) = self.find_route(&req.path, req.method) {
            handler(req, &mut response)?;
            self.apply_compression(req, &mut response);
            return Ok(Dispatch::Response(response));
        }

        if matches!(req.method, Method::Get | Method::Head) {
            if let Some(files) = &self.static_files {
                if files.respond(req, &mut response).await {
                    self.apply_compression(req, &mut response);
                    return Ok(Dispatch::Response(response));
                }
            }
        }

        response.status = 404;
        response.set_header("Content-Type", "text/plain; charset=utf-8");
        response.set_body(b"404 Not Found".to_vec());
        Ok(Dispatch::Response(response))
    }

    /// Gzip the body when the client accepts it, the type is textual, the
    /// body is big enough, nothing is already encoded, and it actually shrinks.
    fn apply_compression(&self, req: &Request, response: &mut Response) {
        if !self.compression.enabled
            || response.body_stream.is_some()
            || response.header("content-encoding").is_some()
            || response.body.len() < self.compression.min_size
        {
            return;
        }
        let accepts = req
            .header("accept-encoding")
            .map(compress::supports_gzip)
            .unwrap_or(false);
        if !accepts {
            return;
        }
        let content_type = response.header("content-type").unwrap_or("").to_string();
        if !self.compression.compressible(&content_type) {
            return;
        }
        let packed = compress::compress(&response.body, self.compression.level);
        if packed.len() < response.body.len() {
            response.set_body(packed);
            response.set_header("Content-Encoding", "gzip");
            response.set_header("Vary", "Accept-Encoding");
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
