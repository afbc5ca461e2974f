/*
 * mod.rs
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

//! HTTP/1.1 message layer: parsed requests, responses, the wire parser, dates.
//!
//! - Requests are parsed whole from the connection buffer (`h1::parse_request`),
//!   with bytes-consumed returned for keep-alive splicing.
//! - Responses serialize to a contiguous buffer; file bodies stream separately.
//! - Buffers use the `bytes` crate throughout.

pub mod date;
pub mod h1;
mod request;
mod response;

pub use request::{decode_component, Method, Request};
pub use response::{canonical_case, status_message, BodyStream, Response, SERVER_NAME};
