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

//! WebSocket (RFC 6455): frame codec, server handshake, framed connection.

pub mod connection;
pub mod frame;
pub mod handshake;

pub use connection::{
    WebSocketConnection, WsCounters, WsHandlers, WsOutbox, WsState, INACTIVITY_TIMEOUT,
    PING_INTERVAL,
};
pub use frame::{apply_mask, parse_frame, Frame, FrameError, OpCode, DEFAULT_MAX_FRAME_SIZE};
pub use handshake::{
    accept_response, compute_accept, is_upgrade_request, reject_response, validate_upgrade,
};
