/*
 * lib.rs
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

//! Portiere core: a concurrent HTTP/1.1 server with WebSocket support, TLS
//! termination, conditional static file service, and pluggable rate limiting.
//!
//! The wire layer lives under [`protocol`] (HTTP/1.1 parsing and
//! serialization, WebSocket frames and handshake). The serving layer lives
//! under [`server`] (per-connection state machine, router + middleware,
//! static files, rate limiter, orchestrator). Everything network-facing is
//! async on tokio; buffers use the `bytes` crate.

pub mod compress;
pub mod config;
pub mod logging;
pub mod mime;
pub mod net;
pub mod protocol;
pub mod server;
pub mod stats;

pub use config::{ConfigError, RateLimitConfig, ServerConfig};
pub use protocol::http::{Method, Request, Response};
pub use protocol::websocket::{WsHandlers, WsOutbox};
pub use server::files::StaticFiles;
pub use server::ratelimit::{RateLimitResult, RateLimiter};
pub use server::router::{Dispatch, HandlerError, MiddlewareAction, Router};
pub use server::workers::WorkerPool;
pub use server::{Server, ShutdownHandle};
pub use stats::{ServerStats, StatsSnapshot};
