/*
 * connection.rs
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

//! WebSocket connection after a successful upgrade: frame loop with
//! fragmentation reassembly, ping timer, inactivity timeout, close protocol.

use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::protocol::websocket::frame::{
    parse_frame, Frame, FrameError, OpCode, DEFAULT_MAX_FRAME_SIZE,
};

/// Unsolicited PING cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Close the connection after this long without a received frame.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace period between sending CLOSE and dropping the socket.
const CLOSE_LINGER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Per-connection traffic counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsCounters {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Messages queued by handlers during dispatch; the connection writes them
/// in order once the handler returns. Keeps handlers synchronous while the
/// socket stays owned by the frame loop.
#[derive(Default)]
pub struct WsOutbox {
    frames: Vec<Frame>,
    close: Option<(u16, String)>,
}

impl WsOutbox {
    pub fn send_text(&mut self, text: &str) {
        self.frames
            .push(Frame::new(OpCode::Text, text.as_bytes().to_vec()));
    }

    pub fn send_binary(&mut self, data: &[u8]) {
        self.frames.push(Frame::new(OpCode::Binary, data.to_vec()));
    }

    pub fn send_ping(&mut self, data: &[u8]) {
        self.frames.push(Frame::new(OpCode::Ping, data.to_vec()));
    }

    pub fn send_pong(&mut self, data: &[u8]) {
        self.frames.push(Frame::new(OpCode::Pong, data.to_vec()));
    }

    /// Request an orderly close after the queued frames are flushed.
    pub fn close(&mut self, code: u16, reason: &str) {
        self.close = Some((code, reason.to_string()));
    }
}

/// Event handlers as plain function values. A route's factory builds one of
/// these per connection.
#[derive(Default)]
pub struct WsHandlers {
    pub on_text: Option<Box<dyn FnMut(&str, &mut WsOutbox) + Send>>,
    pub on_binary: Option<Box<dyn FnMut(&[u8], &mut WsOutbox) + Send>>,
    pub on_close: Option<Box<dyn FnMut(Option<u16>, &str) + Send>>,
    pub on_error: Option<Box<dyn FnMut(&io::Error) + Send>>,
}

impl WsHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_text(mut self, f: impl FnMut(&str, &mut WsOutbox) + Send + 'static) -> Self {
        self.on_text = Some(Box::new(f));
        self
    }

    pub fn on_binary(mut self, f: impl FnMut(&[u8], &mut WsOutbox) + Send + 'static) -> Self {
        self.on_binary = Some(Box::new(f));
        self
    }

    pub fn on_close(mut self, f: impl FnMut(Option<u16>, &str) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnMut(&io::Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// WebSocket connection in frame mode. Owns the upgraded stream; `run()`
/// drives the read loop until close or error.
pub struct WebSocketConnection<S> {
    stream: S,
    read_buf: BytesMut,
    state: WsState,
    handlers: WsHandlers,
    /// In-progress fragmented message: initial opcode + accumulated payload.
    assembly: Option<(OpCode, Vec<u8>)>,
    counters: WsCounters,
    max_frame_size: usize,
    last_activity: Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WebSocketConnection<S> {
    /// Wrap an upgraded stream. `leftover` holds bytes that arrived after the
    /// handshake request (possibly the first frames).
    pub fn new(stream: S, leftover: BytesMut, handlers: WsHandlers) -> Self {
        Self {
            stream,
            read_buf: leftover,
            state: WsState::Open,
            handlers,
            assembly: None,
            counters: WsCounters::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            last_activity: Instant::now(),
        }
    }

    pub fn set_max_frame_size(&mut self, max: usize) {
        self.max_frame_size = max;
    }

    pub fn state(&self) -> WsState {
        self.state
    }

    pub fn counters(&self) -> WsCounters {
        self.counters
    }

    /// Frame loop: read, parse, dispatch, flush handler output. Returns when
    /// the connection reaches Closed.
    pub async fn run(&mut self) -> io::Result<()> {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await; // the first tick fires immediately

        loop {
            self.drain_frames().await?;
            if self.state == WsState::Closed {
                return Ok(());
            }
            if self.state == WsState::Closing {
                self.finish_close().await;
                return Ok(());
            }

            let idle_deadline = self.last_activity + INACTIVITY_TIMEOUT;
            let mut tmp = [0u8; 8192];
            tokio::select! {
                _ = ping.tick() => {
                    self.write_frame(&Frame::new(OpCode::Ping, Vec::new())).await?;
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    let err = io::Error::new(io::ErrorKind::TimedOut, "websocket inactivity timeout");
                    self.emit_error(&err);
                    self.state = WsState::Closed;
                    let _ = self.stream.shutdown().await;
                    return Ok(());
                }
                read = self.stream.read(&mut tmp) => {
                    match read {
                        Ok(0) => {
                            self.state = WsState::Closed;
                            return Ok(());
                        }
                        Ok(n) => {
                            self.read_buf.extend_from_slice(&tmp[..n]);
                            self.last_activity = Instant::now();
                        }
                        Err(e) if is_quiet_disconnect(&e) => {
                            self.state = WsState::Closed;
                            return Ok(());
                        }
                        Err(e) => {
                            self.emit_error(&e);
                            self.state = WsState::Closed;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Parse and dispatch every complete frame in the buffer.
    async fn drain_frames(&mut self) -> io::Result<()> {
        loop {
            if self.state != WsState::Open {
                return Ok(());
            }
            let (frame, consumed) = match parse_frame(&self.read_buf, self.max_frame_size) {
                Ok(x) => x,
                Err(FrameError::NeedMore) => return Ok(()),
                Err(e) => {
                    let err = io::Error::new(io::ErrorKind::InvalidData, e.to_string());
                    return self.protocol_error(err).await;
                }
            };
            self.read_buf.advance(consumed);

            if !frame.masked {
                let err =
                    io::Error::new(io::ErrorKind::InvalidData, "client frame must be masked");
                return self.protocol_error(err).await;
            }
            if frame.rsv1 || frame.rsv2 || frame.rsv3 {
                // No extension negotiated, so RSV bits must be clear.
                let err = io::Error::new(io::ErrorKind::InvalidData, "unexpected RSV bits");
                return self.protocol_error(err).await;
            }

            self.counters.bytes_received += frame.payload.len() as u64;
            let mut outbox = WsOutbox::default();
            match frame.opcode {
                OpCode::Ping => {
                    outbox.send_pong(&frame.payload);
                }
                OpCode::Pong => {
                    // Already counted as activity on read.
                }
                OpCode::Close => {
                    let (code, reason) = parse_close_payload(&frame.payload);
                    if let Some(f) = self.handlers.on_close.as_mut() {
                        f(code, &reason);
                    }
                    self.state = WsState::Closing;
                    return Ok(());
                }
                OpCode::Text | OpCode::Binary => {
                    if self.assembly.is_some() {
                        let err = io::Error::new(
                            io::ErrorKind::InvalidData,
                            "data frame while a fragmented message is in progress",
                        );
                        return self.protocol_error(err).await;
                    }
                    if frame.fin {
                        if let Err(e) =
                            self.deliver_message(frame.opcode, &frame.payload, &mut outbox)
                        {
                            return self.protocol_error(e).await;
                        }
                    } else {
                        self.assembly = Some((frame.opcode, frame.payload));
                    }
                }
                OpCode::Continuation => {
                    let (initial, mut payload) = match self.assembly.take() {
                        Some(a) => a,
                        None => {
                            let err = io::Error::new(
                                io::ErrorKind::InvalidData,
                                "continuation frame without a message in progress",
                            );
                            return self.protocol_error(err).await;
                        }
                    };
                    if payload.len() + frame.payload.len() > self.max_frame_size {
                        let err = io::Error::new(
                            io::ErrorKind::InvalidData,
                            "fragmented message too large",
                        );
                        return self.protocol_error(err).await;
                    }
                    payload.extend_from_slice(&frame.payload);
                    if frame.fin {
                        if let Err(e) = self.deliver_message(initial, &payload, &mut outbox) {
                            return self.protocol_error(e).await;
                        }
                    } else {
                        self.assembly = Some((initial, payload));
                    }
                }
            }
            self.flush_outbox(outbox).await?;
        }
    }

    /// Hand a complete message to the matching handler.
    fn deliver_message(
        &mut self,
        opcode: OpCode,
        payload: &[u8],
        outbox: &mut WsOutbox,
    ) -> io::Result<()> {
        self.counters.messages_received += 1;
        match opcode {
            OpCode::Text => {
                let text = std::str::from_utf8(payload).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "text message is not UTF-8")
                })?;
                if let Some(f) = self.handlers.on_text.as_mut() {
                    f(text, outbox);
                }
            }
            OpCode::Binary => {
                if let Some(f) = self.handlers.on_binary.as_mut() {
                    f(payload, outbox);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn flush_outbox(&mut self, outbox: WsOutbox) -> io::Result<()> {
        for frame in &outbox.frames {
            self.write_frame(frame).await?;
            self.counters.messages_sent += 1;
        }
        if let Some((code, reason)) = outbox.close {
            self.close(code, &reason).await?;
        }
        Ok(())
    }

    /// Send a text frame.
    pub async fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send_data(OpCode::Text, text.as_bytes()).await
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_data(OpCode::Binary, data).await
    }

    /// Send a ping frame (payload max 125 bytes).
    pub async fn send_ping(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_control(OpCode::Ping, data).await
    }

    /// Send a pong frame (payload max 125 bytes).
    pub async fn send_pong(&mut self, data: &[u8]) -> io::Result<()> {
        self.send_control(OpCode::Pong, data).await
    }

    async fn send_data(&mut self, opcode: OpCode, data: &[u8]) -> io::Result<()> {
        if self.state != WsState::Open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "not open"));
        }
        self.write_frame(&Frame::new(opcode, data.to_vec())).await?;
        self.counters.messages_sent += 1;
        Ok(())
    }

    async fn send_control(&mut self, opcode: OpCode, data: &[u8]) -> io::Result<()> {
        if data.len() > 125 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "control payload max 125 bytes",
            ));
        }
        self.write_frame(&Frame::new(opcode, data.to_vec())).await
    }

    /// Initiate an orderly close: CLOSE frame with code + reason, then drop
    /// the socket after a short linger for the peer's final ACK.
    pub async fn close(&mut self, code: u16, reason: &str) -> io::Result<()> {
        if self.state != WsState::Open {
            return Ok(());
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        payload.truncate(125);
        self.write_frame(&Frame::new(OpCode::Close, payload)).await?;
        self.state = WsState::Closing;
        self.finish_close().await;
        Ok(())
    }

    async fn finish_close(&mut self) {
        tokio::time::sleep(CLOSE_LINGER).await;
        let _ = self.stream.shutdown().await;
        self.state = WsState::Closed;
    }

    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let wire = frame.encode();
        self.stream.write_all(&wire).await?;
        self.stream.flush().await?;
        self.counters.bytes_sent += wire.len() as u64;
        Ok(())
    }

    async fn protocol_error(&mut self, err: io::Error) -> io::Result<()> {
        tracing::debug!("[ws] protocol error: {}", err);
        self.emit_error(&err);
        self.state = WsState::Closed;
        let _ = self.stream.shutdown().await;
        Err(err)
    }

    fn emit_error(&mut self, err: &io::Error) {
        if let Some(f) = self.handlers.on_error.as_mut() {
            f(err);
        }
    }
}

/// CLOSE payload: optional 2-byte big-endian code followed by a UTF-8 reason.
fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (Some(code), reason)
    } else {
        (None, String::new())
    }
}

fn is_quiet_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
